use std::{net::SocketAddr, rc::Rc, str::FromStr, time::Duration};

use eyre::Context;
use quill::{error::ServeError, Conf, Protocol};
use tracing::Level;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};

mod driver;
use driver::DemoDriver;

const USAGE: &str = "\
Usage: quill-server [OPTIONS]

Options:
  -a, --addr <ADDR>            address to listen on [env: ADDR, default: 127.0.0.1]
  -p, --port <PORT>            port to listen on [env: PORT, default: 8080]
  -w, --workers <N>            worker threads [env: WORKERS, default: one per core]
      --idle-timeout <SECS>    close idle connections after this long [env: IDLE_TIMEOUT, default: 40]
      --max-body <BYTES>       largest request body accepted [env: MAX_BODY, default: 50 MiB]
  -h, --help                   print this message
";

#[derive(Debug)]
struct Settings {
    addr: String,
    port: u16,
    workers: usize,
    idle_timeout: Duration,
    max_body: u64,
}

impl Settings {
    fn from_env() -> eyre::Result<Self> {
        fn var<T>(name: &str, default: T) -> eyre::Result<T>
        where
            T: FromStr,
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            match std::env::var(name) {
                Ok(v) => v.parse().wrap_err_with(|| format!("invalid {name}")),
                Err(_) => Ok(default),
            }
        }

        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        Ok(Self {
            addr: std::env::var("ADDR").unwrap_or("127.0.0.1".to_string()),
            port: var("PORT", 8080)?,
            workers: var("WORKERS", workers)?,
            idle_timeout: Duration::from_secs(var("IDLE_TIMEOUT", 40)?),
            max_body: var("MAX_BODY", 50 * 1024 * 1024)?,
        })
    }

    /// Command-line flags win over the environment
    fn apply_args(&mut self) -> Result<(), lexopt::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        while let Some(arg) = parser.next()? {
            match arg {
                Short('a') | Long("addr") => self.addr = parser.value()?.string()?,
                Short('p') | Long("port") => self.port = parser.value()?.parse()?,
                Short('w') | Long("workers") => self.workers = parser.value()?.parse()?,
                Long("idle-timeout") => {
                    self.idle_timeout = Duration::from_secs(parser.value()?.parse()?)
                }
                Long("max-body") => self.max_body = parser.value()?.parse()?,
                Short('h') | Long("help") => {
                    print!("{USAGE}");
                    std::process::exit(0);
                }
                _ => return Err(arg.unexpected()),
            }
        }
        Ok(())
    }

    fn listen_addr(&self) -> eyre::Result<SocketAddr> {
        SocketAddr::from_str(&format!("{}:{}", self.addr, self.port))
            .wrap_err("invalid listen address")
    }

    fn conf(&self) -> Conf {
        let mut conf = Conf {
            idle_timeout: self.idle_timeout,
            ..Default::default()
        };
        conf.h1.max_body_size = self.max_body;
        conf.h2.max_body_size = self.max_body;
        conf
    }
}

fn main() -> eyre::Result<()> {
    setup_tracing_and_error_reporting()?;

    let mut settings = Settings::from_env()?;
    settings.apply_args()?;
    let workers = settings.workers.max(1);

    let ln = std::net::TcpListener::bind(settings.listen_addr()?)?;
    ln.set_nonblocking(true)?;
    tracing::info!(addr = %ln.local_addr()?, %workers, "listening");

    for id in 0..workers {
        let ln = ln.try_clone()?;
        let conf = settings.conf();
        std::thread::Builder::new()
            .name(format!("quill-worker-{id}"))
            .spawn(move || {
                if let Err(e) = run_worker(ln, conf) {
                    tracing::error!(%id, "worker failed: {e:?}");
                }
            })?;
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(tokio::signal::ctrl_c())?;
    tracing::info!("interrupted, shutting down");
    Ok(())
}

/// Accepts connections on its own single-threaded runtime. Connections never
/// move between workers.
fn run_worker(ln: std::net::TcpListener, conf: Conf) -> eyre::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, accept_loop(ln, conf))
}

async fn accept_loop(ln: std::net::TcpListener, conf: Conf) -> eyre::Result<()> {
    let ln = tokio::net::TcpListener::from_std(ln)?;
    let conf = Rc::new(conf);
    let driver = Rc::new(DemoDriver);

    loop {
        let (stream, addr) = ln.accept().await?;
        tracing::debug!(%addr, "accepted connection");
        stream.set_nodelay(true)?;

        let conf = conf.clone();
        let driver = driver.clone();
        tokio::task::spawn_local(async move {
            match quill::serve(stream, conf, driver, Protocol::Detect).await {
                Ok(()) => tracing::debug!(%addr, "connection done"),
                Err(ServeError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::debug!(%addr, "peer went away")
                }
                Err(e) => tracing::warn!(%addr, "connection error: {e}"),
            }
        });
    }
}

fn setup_tracing_and_error_reporting() -> eyre::Result<()> {
    color_eyre::install()?;

    let targets = if let Ok(rust_log) = std::env::var("RUST_LOG") {
        rust_log.parse::<Targets>()?
    } else {
        Targets::new()
            .with_default(Level::INFO)
            .with_target("quill", Level::DEBUG)
            .with_target("quill_server", Level::DEBUG)
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_names(true);

    tracing_subscriber::registry()
        .with(targets)
        .with(fmt_layer)
        .init();
    Ok(())
}
