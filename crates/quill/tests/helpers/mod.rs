use std::{future::Future, rc::Rc};

use quill::{error::ServeError, Conf, Protocol};
use tokio::{io::DuplexStream, task::JoinHandle};

pub(crate) mod driver;
pub(crate) mod tracing_common;
pub(crate) mod wire;

pub(crate) type BoxError = Box<dyn std::error::Error>;

/// Runs a test on a single-threaded runtime, inside a `LocalSet`: nothing
/// in quill is `Send`.
pub(crate) fn run(test: impl Future<Output = Result<(), BoxError>>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        tracing_common::setup_tracing();

        if let Err(e) = test.await {
            panic!("Error: {e}");
        }
    });
}

/// Serves one in-memory connection with [driver::TestDriver], returns the
/// client end.
pub(crate) fn connect(
    conf: Conf,
    protocol: Protocol,
) -> (DuplexStream, JoinHandle<Result<(), ServeError>>) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let handle = tokio::task::spawn_local(quill::serve(
        server,
        Rc::new(conf),
        Rc::new(driver::TestDriver),
        protocol,
    ));
    (client, handle)
}
