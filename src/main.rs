//! v4l2-compat binary: drives an emulated capture device the way a V4L2
//! application would, through descriptors, ioctls and mappings.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use v4l2_compat::abi::{
    BufferDesc, BufferFlags, Capability, FmtDesc, FrameSizeEnum, RequestBuffers, V4l2Format,
    BUF_TYPE_VIDEO_CAPTURE,
};
use v4l2_compat::ioctl::{
    VIDIOC_DQBUF, VIDIOC_ENUM_FMT, VIDIOC_ENUM_FRAMESIZES, VIDIOC_QBUF, VIDIOC_QUERYBUF,
    VIDIOC_QUERYCAP, VIDIOC_REQBUFS, VIDIOC_STREAMOFF, VIDIOC_STREAMON, VIDIOC_S_FMT,
};
use v4l2_compat::{
    CameraSource, CompatManager, Error, FourCC, HeapMapper, IoctlArg, Protection, Result,
    TestPattern, V4l2Source, VirtualCameraConfig, VirtualSource,
};

const POLL_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_POLL_TIMEOUTS: u32 = 5;

#[derive(Parser)]
#[command(name = "v4l2-compat")]
#[command(about = "Drive an emulated V4L2 capture device")]
#[command(version)]
struct Cli {
    /// Kernel capture device to emulate (/dev/videoN); a virtual camera is used when omitted
    #[arg(short, long, global = true)]
    device: Option<usize>,

    /// Test pattern of the virtual camera
    #[arg(long, value_enum, default_value = "color-bars", global = true)]
    pattern: PatternArg,

    /// Frame interval of the virtual camera in milliseconds
    #[arg(long, default_value = "33", global = true)]
    interval_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity, formats and frame sizes of the emulated device
    Info,

    /// Capture frames through the MMAP streaming path
    Capture(CaptureArgs),
}

#[derive(Args)]
struct CaptureArgs {
    /// Frame width
    #[arg(long, default_value = "640")]
    width: u32,

    /// Frame height
    #[arg(long, default_value = "480")]
    height: u32,

    /// Pixel format as a four character code
    #[arg(short, long, default_value = "YUYV", value_parser = parse_fourcc)]
    format: FourCC,

    /// Number of buffers to request
    #[arg(short, long, default_value = "4")]
    buffers: u32,

    /// Number of frames to capture
    #[arg(short = 'n', long, default_value = "10")]
    frames: u32,

    /// Open non-blocking and wait for frames with poll
    #[arg(long)]
    nonblocking: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum PatternArg {
    ColorBars,
    Gradient,
    Gray,
}

impl From<PatternArg> for TestPattern {
    fn from(pattern: PatternArg) -> Self {
        match pattern {
            PatternArg::ColorBars => Self::ColorBars,
            PatternArg::Gradient => Self::Gradient,
            PatternArg::Gray => Self::Solid(128, 128, 128),
        }
    }
}

fn parse_fourcc(value: &str) -> std::result::Result<FourCC, String> {
    let code: [u8; 4] = value
        .as_bytes()
        .try_into()
        .map_err(|_| format!("'{value}' is not a four character code"))?;
    Ok(FourCC::new(&code))
}

fn main() {
    // Set RUST_LOG to control the log level, e.g. RUST_LOG=v4l2_compat=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let source: Arc<dyn CameraSource> = match cli.device {
        Some(index) => Arc::new(V4l2Source::probe(index)?),
        None => Arc::new(VirtualSource::new(
            VirtualCameraConfig::default()
                .with_pattern(cli.pattern.into())
                .with_frame_interval(Duration::from_millis(cli.interval_ms)),
        )),
    };

    let mapper = Arc::new(HeapMapper::new());
    let manager = CompatManager::new(Arc::<HeapMapper>::clone(&mapper));
    let index = manager.register(source);
    let path = format!("/dev/video{index}");

    match cli.command {
        Commands::Info => show_info(&manager, &path),
        Commands::Capture(args) => capture(&manager, &mapper, &path, &args),
    }
}

/// Issue `code` on `fd` and hand back the argument the device filled in.
fn request(manager: &CompatManager, fd: i32, code: u64, mut arg: IoctlArg) -> Result<IoctlArg> {
    manager.ioctl(fd, code, Some(&mut arg))?;
    Ok(arg)
}

fn show_info(manager: &CompatManager, path: &str) -> Result<()> {
    let fd = manager.open(path, libc::O_RDWR)?;

    if let IoctlArg::Capability(cap) = request(
        manager,
        fd,
        VIDIOC_QUERYCAP,
        IoctlArg::Capability(Capability::default()),
    )? {
        println!("Device: {path}");
        println!("  Driver: {}", cap.driver);
        println!("  Card: {}", cap.card);
        println!("  Bus: {}", cap.bus_info);
        println!("  Capabilities: {:#010x}", cap.device_caps.bits());
    }

    for index in 0.. {
        let desc = FmtDesc {
            index,
            type_: BUF_TYPE_VIDEO_CAPTURE,
            ..FmtDesc::default()
        };
        let Ok(IoctlArg::FmtDesc(desc)) =
            request(manager, fd, VIDIOC_ENUM_FMT, IoctlArg::FmtDesc(desc))
        else {
            break;
        };
        println!("  Format {index}: {} ({})", desc.pixelformat, desc.description);

        for size_index in 0.. {
            let size = FrameSizeEnum {
                index: size_index,
                pixel_format: desc.pixelformat,
                ..FrameSizeEnum::default()
            };
            let Ok(IoctlArg::FrameSize(size)) =
                request(manager, fd, VIDIOC_ENUM_FRAMESIZES, IoctlArg::FrameSize(size))
            else {
                break;
            };
            println!("    {}x{}", size.width, size.height);
        }
    }

    manager.close(fd)
}

fn capture(
    manager: &CompatManager,
    mapper: &HeapMapper,
    path: &str,
    args: &CaptureArgs,
) -> Result<()> {
    let flags = if args.nonblocking {
        libc::O_RDWR | libc::O_NONBLOCK
    } else {
        libc::O_RDWR
    };
    let fd = manager.open(path, flags)?;

    let requested = V4l2Format::capture(args.format, args.width, args.height);
    if let IoctlArg::Format(fmt) = request(manager, fd, VIDIOC_S_FMT, IoctlArg::Format(requested))? {
        println!(
            "Format: {}x{} {} ({} bytes per frame)",
            fmt.pix.width, fmt.pix.height, fmt.pix.pixelformat, fmt.pix.sizeimage
        );
    }

    let granted = match request(
        manager,
        fd,
        VIDIOC_REQBUFS,
        IoctlArg::RequestBuffers(RequestBuffers::mmap(args.buffers)),
    )? {
        IoctlArg::RequestBuffers(req) => req.count,
        _ => 0,
    };
    println!("Buffers: {granted}");

    let mut mappings = Vec::new();
    for index in 0..granted {
        let IoctlArg::Buffer(buf) = request(
            manager,
            fd,
            VIDIOC_QUERYBUF,
            IoctlArg::Buffer(BufferDesc::mmap(index)),
        )?
        else {
            continue;
        };
        let length = usize::try_from(buf.length).unwrap_or_default();
        let addr = manager.mmap(
            fd,
            length,
            Protection::READ | Protection::WRITE,
            u64::from(buf.offset),
        )?;
        mappings.push((addr, length));
        request(manager, fd, VIDIOC_QBUF, IoctlArg::Buffer(BufferDesc::mmap(index)))?;
    }

    request(manager, fd, VIDIOC_STREAMON, IoctlArg::Int(BUF_TYPE_VIDEO_CAPTURE))?;

    let mut captured = 0;
    let mut timeouts = 0;
    while captured < args.frames {
        if args.nonblocking && !manager.poll(fd, POLL_TIMEOUT)? {
            timeouts += 1;
            warn!(fd, timeouts, "no frame within poll timeout");
            if timeouts == MAX_POLL_TIMEOUTS {
                return Err(Error::backend(libc::ETIMEDOUT, "camera delivered no frames"));
            }
            continue;
        }

        let buf = match request(manager, fd, VIDIOC_DQBUF, IoctlArg::Buffer(BufferDesc::mmap(0))) {
            Ok(IoctlArg::Buffer(buf)) => buf,
            Ok(_) | Err(Error::WouldBlock) => continue,
            Err(err) => return Err(err),
        };
        timeouts = 0;

        let checksum = usize::try_from(buf.index)
            .ok()
            .and_then(|index| mappings.get(index))
            .and_then(|(addr, _)| mapper.region(*addr))
            .map_or(0, |region| {
                region.read_with(|data| data.iter().map(|byte| u64::from(*byte)).sum::<u64>())
            });
        let status = if buf.flags.contains(BufferFlags::ERROR) {
            " (error)"
        } else {
            ""
        };
        println!(
            "Frame {}: buffer {}, {} bytes, timestamp {}.{:06}s, checksum {checksum:#x}{status}",
            buf.sequence, buf.index, buf.bytesused, buf.timestamp.sec, buf.timestamp.usec
        );
        captured += 1;

        request(manager, fd, VIDIOC_QBUF, IoctlArg::Buffer(BufferDesc::mmap(buf.index)))?;
    }

    request(manager, fd, VIDIOC_STREAMOFF, IoctlArg::Int(BUF_TYPE_VIDEO_CAPTURE))?;
    for (addr, length) in mappings {
        manager.munmap(addr, length)?;
    }
    request(
        manager,
        fd,
        VIDIOC_REQBUFS,
        IoctlArg::RequestBuffers(RequestBuffers::mmap(0)),
    )?;
    manager.close(fd)?;

    info!(captured, "capture finished");
    Ok(())
}
