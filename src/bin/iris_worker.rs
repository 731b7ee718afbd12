//! Worker process hosting one isolated algorithm module.
//!
//! Invoked by `IsolatedProxy::spawn` with two arguments: the module binary
//! path and the number of an inherited socket fd connected to the proxy.

use iris::link::UnixChannel;
use iris::module::ModuleManager;
use iris::proxy::IpaHost;
use std::os::fd::RawFd;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "algorithm worker failed");
        std::process::exit(1);
    }
}

fn run() -> iris::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(module_path), Some(fd_arg)) = (args.next(), args.next()) else {
        return Err(usage_error("usage: iris_worker <module.so> <socket-fd>"));
    };
    let fd: RawFd = fd_arg
        .parse()
        .map_err(|_| usage_error("socket fd argument is not a number"))?;

    let manager = ModuleManager::new();
    // SAFETY: the parent chose this module path; the worker exists exactly
    // to contain whatever the module does.
    let module = unsafe { manager.load_from_path(&module_path)? };
    let wrapper = module.create_context()?;

    // SAFETY: the parent passed us sole ownership of this connected socket.
    let channel = unsafe { UnixChannel::from_raw_fd(fd)? };

    IpaHost::new(Box::new(channel), wrapper).run()
}

fn usage_error(msg: &str) -> iris::Error {
    iris::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))
}
