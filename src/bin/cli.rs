use anyhow::{anyhow, bail, Context, Result};
use chartlink::capture::{CameraProvider, CaptureConstraints, MediaCaptureController};
use chartlink::flow::{self, Document, PhotoFlow};
use chartlink::pairing_qr::PairingQr;
use chartlink::transport::relay::{RelayBroker, RendezvousServer};
use chartlink::{ChartlinkConfig, Envelope, JoinedSession, Session, SessionOptions, SessionRole};
use std::env;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

const USAGE: &str = "\
Usage: chartlink-cli <command> [args] [--config <path>] [--broker <addr>] [--base-url <url>]

Commands:
  broker [--bind <addr>]             run the rendezvous relay
  share <file> [--name <title>]      offer a document behind a QR code
  receive <url> [--out <dir>]        join a document session and save the file
  photo-host [--out <dir>]           wait for a photo behind a QR code
  photo-send <url> [--synthetic]     join a photo session, take and send a shot";

/// Flags shared by every command plus its positional arguments
struct Args {
    command: String,
    positional: Vec<String>,
    config: Option<PathBuf>,
    broker: Option<String>,
    base_url: Option<String>,
    bind: Option<String>,
    out: PathBuf,
    name: Option<String>,
    synthetic: bool,
}

fn flag_value(raw: &[String], i: &mut usize) -> Result<String> {
    let flag = &raw[*i];
    *i += 1;
    raw.get(*i)
        .cloned()
        .ok_or_else(|| anyhow!("{} needs a value", flag))
}

impl Args {
    fn parse(raw: &[String]) -> Result<Self> {
        let command = raw.get(1).cloned().ok_or_else(|| anyhow!(USAGE))?;
        let mut args = Args {
            command,
            positional: Vec::new(),
            config: None,
            broker: None,
            base_url: None,
            bind: None,
            out: PathBuf::from("."),
            name: None,
            synthetic: false,
        };

        let mut i = 2;
        while i < raw.len() {
            match raw[i].as_str() {
                "--config" => args.config = Some(PathBuf::from(flag_value(raw, &mut i)?)),
                "--broker" => args.broker = Some(flag_value(raw, &mut i)?),
                "--base-url" => args.base_url = Some(flag_value(raw, &mut i)?),
                "--bind" => args.bind = Some(flag_value(raw, &mut i)?),
                "--out" => args.out = PathBuf::from(flag_value(raw, &mut i)?),
                "--name" => args.name = Some(flag_value(raw, &mut i)?),
                "--synthetic" => args.synthetic = true,
                flag if flag.starts_with("--") => bail!("Unknown flag: {}", flag),
                positional => args.positional.push(positional.to_string()),
            }
            i += 1;
        }
        Ok(args)
    }

    fn positional(&self, index: usize, what: &str) -> Result<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("{} required\n\n{}", what, USAGE))
    }

    fn load_config(&self) -> Result<ChartlinkConfig> {
        let path = self.config.clone().unwrap_or_else(ChartlinkConfig::default_path);
        let mut config = ChartlinkConfig::load_layered(&path)
            .with_context(|| format!("loading {}", path.display()))?;
        if let Some(broker) = &self.broker {
            config.pairing.broker_addr = broker.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.pairing.base_url = base_url.clone();
        }
        config.validate().map_err(|e| anyhow!(e))?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    chartlink::init_logging();

    let raw: Vec<String> = env::args().collect();
    let args = Args::parse(&raw)?;

    let (interrupt_tx, interrupt) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })
    .context("installing Ctrl-C handler")?;

    match args.command.as_str() {
        "broker" => cmd_broker(&args, interrupt).await,
        "share" => cmd_share(&args, interrupt).await,
        "receive" => cmd_receive(&args, interrupt).await,
        "photo-host" => cmd_photo_host(&args, interrupt).await,
        "photo-send" => cmd_photo_send(&args, interrupt).await,
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

/// Run `work` unless Ctrl-C arrives first
async fn interruptible<T>(
    interrupt: &mut mpsc::UnboundedReceiver<()>,
    work: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        result = work => Some(result),
        _ = interrupt.recv() => {
            eprintln!("Interrupted");
            None
        }
    }
}

async fn cmd_broker(args: &Args, mut interrupt: mpsc::UnboundedReceiver<()>) -> Result<()> {
    let config = args.load_config()?;
    let bind = args.bind.clone().unwrap_or(config.pairing.broker_addr);
    let server = RendezvousServer::bind(bind.as_str()).await?;
    println!("Rendezvous relay listening on {}", server.local_addr()?);

    if let Some(result) = interruptible(&mut interrupt, server.run()).await {
        result?;
    }
    Ok(())
}

fn print_pairing(session: &Session, config: &ChartlinkConfig) -> Result<()> {
    let image = PairingQr::from(&config.qr).render_pairing(session)?;
    println!("{}", image.to_terminal());
    println!("Scan or open: {}", session.url());
    Ok(())
}

async fn cmd_share(args: &Args, mut interrupt: mpsc::UnboundedReceiver<()>) -> Result<()> {
    let config = args.load_config()?;
    let path = PathBuf::from(args.positional(0, "file")?);
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?
        .to_string();
    let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let document = Document {
        bytes,
        display_name: args.name.clone().unwrap_or_else(|| filename.clone()),
        filename,
    };

    let broker = Arc::new(RelayBroker::new(config.pairing.broker_addr.clone()));
    let session = Session::create(SessionRole::Document, broker, SessionOptions::from(&config)).await?;
    print_pairing(&session, &config)?;

    let timeout = session.options().listen_timeout;
    let shared = interruptible(&mut interrupt, async {
        let envelope = flow::share_document(&session, &document, timeout).await?;
        // the receiver hangs up once it has the file
        let mut states = session.endpoint().subscribe_state();
        while !states.borrow_and_update().is_terminal() {
            if states.changed().await.is_err() {
                break;
            }
        }
        Ok::<Envelope, chartlink::PairingError>(envelope)
    })
    .await;

    let Some(shared) = shared else {
        session.close();
        return Ok(());
    };
    let envelope = shared?;
    println!("Sent {} ({} bytes), session {}", document.filename, envelope.len(), session.state());
    Ok(())
}

fn save(out: &Path, envelope: &Envelope, fallback: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    // keep only the final path component of a remote-supplied name
    let name = envelope
        .filename()
        .and_then(|n| Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or(fallback);
    let path = out.join(name);
    std::fs::write(&path, envelope.payload()).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

async fn cmd_receive(args: &Args, mut interrupt: mpsc::UnboundedReceiver<()>) -> Result<()> {
    let config = args.load_config()?;
    let url = args.positional(0, "pairing URL")?;
    let broker = Arc::new(RelayBroker::new(config.pairing.broker_addr.clone()));

    let Some(joined) = interruptible(
        &mut interrupt,
        JoinedSession::join(url, broker, SessionOptions::from(&config)),
    )
    .await
    else {
        return Ok(());
    };
    let joined = joined?;
    if joined.role() != SessionRole::Document {
        joined.close();
        bail!("{} is a {} session, use photo-send", url, joined.role());
    }

    let Some(received) = interruptible(&mut interrupt, flow::receive_document(&joined, None)).await else {
        joined.close();
        return Ok(());
    };
    let envelope = received?;
    let path = save(&args.out, &envelope, "document.pdf")?;
    println!(
        "Saved {} ({} bytes)",
        path.display(),
        envelope.len()
    );
    Ok(())
}

async fn cmd_photo_host(args: &Args, mut interrupt: mpsc::UnboundedReceiver<()>) -> Result<()> {
    let config = args.load_config()?;
    let broker = Arc::new(RelayBroker::new(config.pairing.broker_addr.clone()));
    let session = Session::create(SessionRole::Photo, broker, SessionOptions::from(&config)).await?;
    print_pairing(&session, &config)?;

    let timeout = session.options().listen_timeout;
    let Some(received) = interruptible(&mut interrupt, flow::receive_photo(&session, timeout)).await else {
        session.close();
        return Ok(());
    };
    let envelope = received?;
    let path = save(&args.out, &envelope, "photo.jpg")?;
    println!("Saved {} ({} bytes)", path.display(), envelope.len());
    Ok(())
}

fn camera_provider(config: &ChartlinkConfig, synthetic: bool) -> Result<Arc<dyn CameraProvider>> {
    if synthetic {
        return Ok(Arc::new(chartlink::testing::SyntheticCameraProvider::new()));
    }
    #[cfg(feature = "native-camera")]
    {
        Ok(Arc::new(chartlink::capture::native::NativeCameraProvider::new(
            config.capture.device_index,
        )))
    }
    #[cfg(not(feature = "native-camera"))]
    {
        let _ = config;
        bail!("built without the native-camera feature, pass --synthetic")
    }
}

async fn cmd_photo_send(args: &Args, mut interrupt: mpsc::UnboundedReceiver<()>) -> Result<()> {
    let config = args.load_config()?;
    let url = args.positional(0, "pairing URL")?;
    let provider = camera_provider(&config, args.synthetic)?;
    let broker = Arc::new(RelayBroker::new(config.pairing.broker_addr.clone()));

    let Some(joined) = interruptible(
        &mut interrupt,
        JoinedSession::join(url, broker, SessionOptions::from(&config)),
    )
    .await
    else {
        return Ok(());
    };
    let joined = joined?;
    if joined.role() != SessionRole::Photo {
        joined.close();
        bail!("{} is a {} session, use receive", url, joined.role());
    }

    let capture = MediaCaptureController::new(provider, config.capture.jpeg_quality).into_shared();
    let mut photo = PhotoFlow::start(
        joined.endpoint(),
        capture,
        CaptureConstraints::from(&config.capture),
    )?;
    let shot = photo.capture()?;
    println!("Captured {}x{} {}", shot.width, shot.height, shot.mime_type);

    let Some(sent) = interruptible(&mut interrupt, photo.submit(joined.endpoint())).await else {
        joined.close();
        return Ok(());
    };
    let envelope = sent?;
    println!(
        "Sent {} ({} bytes)",
        envelope.filename().unwrap_or("photo"),
        envelope.len()
    );
    joined.close();
    Ok(())
}
