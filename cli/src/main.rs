mod progress_window;

use progress_window::ProgressWindow;
use structopt::StructOpt;

use burn::tensor::backend::AutodiffBackend;
use neural_style::{
    image::ImageOutputFormat as ImgFmt, Error, FeatureExtractor, FrozenWeights, InitialImage,
    LineSearch, Session, StylizedImage,
};
use std::path::PathBuf;

fn parse_img_fmt(input: &str) -> Result<ImgFmt, String> {
    let fmt = match input {
        "png" => ImgFmt::Png,
        "jpg" => ImgFmt::Jpeg(75),
        "bmp" => ImgFmt::Bmp,
        other => {
            return Err(format!(
                "image format `{}` not one of: 'png', 'jpg', 'bmp'",
                other
            ))
        }
    };

    Ok(fmt)
}

#[derive(Copy, Clone)]
enum Init {
    Content,
    Noise,
}

fn parse_init(input: &str) -> Result<Init, String> {
    match input {
        "content" => Ok(Init::Content),
        "noise" => Ok(Init::Noise),
        other => Err(format!("initial image `{}` not one of: 'content', 'noise'", other)),
    }
}

fn parse_line_search(input: &str) -> Result<LineSearch, String> {
    match input {
        "none" => Ok(LineSearch::None),
        "backtracking" => Ok(LineSearch::Backtracking),
        other => Err(format!(
            "line search `{}` not one of: 'none', 'backtracking'",
            other
        )),
    }
}

#[derive(Copy, Clone)]
enum Device {
    Cpu,
    #[cfg(feature = "gpu")]
    Gpu,
}

fn parse_device(input: &str) -> Result<Device, String> {
    match input {
        "cpu" => Ok(Device::Cpu),
        #[cfg(feature = "gpu")]
        "gpu" => Ok(Device::Gpu),
        #[cfg(not(feature = "gpu"))]
        "gpu" => Err("this binary was built without the `gpu` feature".to_owned()),
        other => Err(format!("device `{}` not one of: 'cpu', 'gpu'", other)),
    }
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Tweaks {
    /// The weight of the style loss, larger numbers favor the textures of the style
    /// image over the structure of the content image
    #[structopt(long, default_value = "10000")]
    style_weight: f64,
    /// The weight of the content loss
    #[structopt(long, default_value = "0.001")]
    content_weight: f64,
    /// The layers after which the content loss is measured, comma separated
    #[structopt(long, default_value = "conv_3", use_delimiter = true)]
    content_layers: Vec<String>,
    /// The layers after which the style loss is measured, comma separated
    #[structopt(
        long,
        default_value = "conv_1,conv_2,conv_3,conv_4,conv_5",
        use_delimiter = true
    )]
    style_layers: Vec<String>,
    /// What the optimization starts from, either `content` or `noise`
    #[structopt(long, default_value = "content", parse(try_from_str = parse_init))]
    init: Init,
    /// How the optimizer picks its step length, either `none` or `backtracking`
    #[structopt(long, default_value = "none", parse(try_from_str = parse_line_search))]
    line_search: LineSearch,
    /// A seed for the initial noise, and for the weights when no weights file is given
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// Log the current scores every this many steps
    #[structopt(long, default_value = "50")]
    report_every: usize,
    /// Don't show the progress bar
    #[structopt(long)]
    no_progress: bool,
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Paints the content of one image in the style of another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image whose structure is kept
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose textures are transferred
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// The path to save the stylized image to, the file extensions of the path determines
    /// the image format used. You may use `-` for stdout.
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
    /// The format to save the stylized image as.
    ///
    /// NOTE: this will only apply when stdout is specified via `-o -`, otherwise the image
    /// format is determined by the file extension of the path provided to `-o`
    #[structopt(
        long,
        default_value = "png",
        parse(try_from_str = parse_img_fmt)
    )]
    out_fmt: ImgFmt,
    /// Both inputs are resized to a square of this many pixels
    #[structopt(long, default_value = "256")]
    size: u32,
    /// The number of model evaluations to optimize for
    #[structopt(long, default_value = "100")]
    steps: usize,
    /// A safetensors file with torchvision's VGG-19 `features` weights. Without it the
    /// network is initialized randomly, which still transfers some texture.
    #[structopt(long, parse(from_os_str))]
    weights: Option<PathBuf>,
    /// The device to run on, either `cpu` or `gpu`
    #[structopt(long, default_value = "cpu", parse(try_from_str = parse_device))]
    device: Device,
    /// Log more, can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
    #[structopt(flatten)]
    tweaks: Tweaks,
}

fn main() {
    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    // Check that the extension for the path supplied by the user is one of the ones we support
    {
        match args.output_path.extension().and_then(|ext| ext.to_str()) {
            Some("png") | Some("jpg") | Some("bmp") => {}
            None => {}
            Some(other) => return Err(Error::UnsupportedOutputFormat(other.to_owned())),
        }
    }

    let initial_image = match args.tweaks.init {
        Init::Content => InitialImage::Content,
        Init::Noise => InitialImage::Noise {
            seed: args.tweaks.seed,
        },
    };

    let session = Session::builder()
        .content(&args.content)
        .style(&args.style)
        .resolution(args.size)
        .steps(args.steps)
        .style_weight(args.tweaks.style_weight)
        .content_weight(args.tweaks.content_weight)
        .content_layers(args.tweaks.content_layers.iter().cloned())
        .style_layers(args.tweaks.style_layers.iter().cloned())
        .initial_image(initial_image)
        .line_search(args.tweaks.line_search)
        .report_every(args.tweaks.report_every)
        .build()?;

    let stylized = match args.device {
        Device::Cpu => run::<burn::backend::Autodiff<burn::backend::NdArray>>(
            &args,
            session,
            &Default::default(),
        )?,
        #[cfg(feature = "gpu")]
        Device::Gpu => run::<burn::backend::Autodiff<burn::backend::Wgpu>>(
            &args,
            session,
            &Default::default(),
        )?,
    };

    let report = stylized.report();
    tracing::info!(
        steps = report.steps,
        state = ?report.state,
        style = report.last.style,
        content = report.last.content,
        "done"
    );

    if args.output_path.to_str() == Some("-") {
        let out = std::io::stdout();
        let mut out = out.lock();
        stylized.write(&mut out, args.out_fmt)?;
    } else {
        // This won't respect the output format specified by the user,
        // only the extension on the path they specify, but that makes
        // more sense, and is probably better than detecting and emitting
        // an error
        stylized.save(&args.output_path)?;
    }

    Ok(())
}

fn run<B: AutodiffBackend>(
    args: &Opt,
    session: Session,
    device: &B::Device,
) -> Result<StylizedImage, Error> {
    let extractor = match args.weights {
        Some(ref path) => FeatureExtractor::<B>::new(neural_style::pretrained_vgg19(path)?, device),
        None => {
            tracing::warn!(
                seed = args.tweaks.seed,
                "no weights file given, using randomly initialized VGG-19 weights"
            );
            let weights = FrozenWeights::random(neural_style::vgg19_layout(), args.tweaks.seed);
            FeatureExtractor::<B>::new(&weights, device)
        }
    };

    let progress: Option<Box<dyn neural_style::TransferProgress>> = if !args.tweaks.no_progress {
        Some(Box::new(ProgressWindow::new(args.steps)))
    } else {
        None
    };

    session.run(&extractor, progress)
}
