//! swtchbrd CLI: attach to a TAP device and run the switchboard.

use clap::Parser;

/// Userspace virtual network switchboard.
#[derive(Parser, Debug)]
#[command(name = "swtchbrd", version, about)]
struct Args {
    /// TAP device to attach to (created if absent; requires
    /// /dev/net/tun access).
    #[arg(long, default_value = "swtch0")]
    interface: String,

    /// Log filter, e.g. "info" or "swtchbrd=debug".
    #[arg(long, env = "SWTCHBRD_LOG", default_value = "info")]
    log: String,

    /// Also run the host-side TCP proxy listener.
    #[arg(long)]
    proxy: bool,
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use swtchbrd::iface::TapInterface;
    use swtchbrd::proxy::TcpProxy;
    use swtchbrd::Vnet;
    use tracing::info;

    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&args.log)?)
        .init();

    let iface = TapInterface::open(&args.interface)?;
    let vnet = Vnet::run(iface)?;

    if args.proxy {
        let proxy = TcpProxy::spawn(vnet.routes(), vnet.shutdown_handle()).await?;
        info!(port = proxy.port(), "proxy/tcp: listening");
    }

    let shutdown = vnet.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("signal: shutting down");
            shutdown.trigger();
        }
    });

    vnet.wait().await;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    let _ = Args::parse();
    eprintln!("swtchbrd: the TAP driver is only available on Linux");
    std::process::exit(1);
}
