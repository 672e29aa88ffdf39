use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use clap::Parser;
use dicom_ulp::address::validate_ae_title;
use dicom_ulp::association::{ServerAssociationOptions, Timeouts};
use dicom_ulp::listener::{ListenerOptions, OverflowPolicy};
use dicom_ulp::uids::VERIFICATION;
use dicom_ulp::verification::VerificationHandler;
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// DICOM C-ECHO SCP
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// Verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// Application Entity title of this node
    #[arg(long = "ae-title", default_value = "ECHO-SCP", value_parser = parse_ae_title)]
    ae_title: String,
    /// Accept associations regardless of the called AE title
    #[arg(long = "any-called-ae-title")]
    any_called_ae_title: bool,
    /// Enforce max pdu length
    #[arg(short = 's', long = "strict")]
    strict: bool,
    /// Accept unknown SOP classes
    #[arg(long)]
    promiscuous: bool,
    /// Maximum PDU length
    #[arg(
        short = 'm',
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// Which port to listen on
    #[arg(short, default_value = "11111")]
    port: u16,
    /// Maximum number of concurrent associations
    #[arg(long = "max-associations", default_value = "64")]
    max_associations: usize,
    /// Number of connections allowed to wait for a free association slot
    #[arg(long = "queue", default_value = "0")]
    queue: usize,
    /// Seconds to wait for an association request
    #[arg(long = "accept-timeout", default_value = "30")]
    accept_timeout: u64,
    /// Seconds an association may stay idle
    #[arg(long = "dimse-timeout", default_value = "60")]
    dimse_timeout: u64,
}

fn parse_ae_title(ae_title: &str) -> Result<String, String> {
    validate_ae_title(ae_title).map_err(|e| e.to_string())?;
    Ok(ae_title.to_string())
}

fn main() {
    let app = App::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if app.verbose { Level::DEBUG } else { Level::INFO })
            .with_env_filter(EnvFilter::from_default_env().add_directive(if app.verbose {
                Level::DEBUG.into()
            } else {
                Level::INFO.into()
            }))
            .finish(),
    )
    .whatever_context("Could not set up global logging subscriber")
    .unwrap_or_else(|e: Whatever| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .whatever_context("Could not start async runtime");
    let outcome = match runtime {
        Ok(runtime) => runtime.block_on(run(app)),
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        error!("{}", Report::from_error(e));
        std::process::exit(-2);
    }
}

async fn run(app: App) -> Result<(), Whatever> {
    let App {
        verbose: _,
        ae_title,
        any_called_ae_title,
        strict,
        promiscuous,
        max_pdu_length,
        port,
        max_associations,
        queue,
        accept_timeout,
        dimse_timeout,
    } = app;

    let timeouts = Timeouts {
        accept: Some(Duration::from_secs(accept_timeout)),
        dimse: Some(Duration::from_secs(dimse_timeout)),
        ..Timeouts::default()
    };
    let scp = ServerAssociationOptions::new()
        .ae_title(ae_title)
        .with_abstract_syntax(VERIFICATION)
        .max_pdu_length(max_pdu_length)
        .strict(strict)
        .promiscuous(promiscuous)
        .timeouts(timeouts);

    let overflow = if queue == 0 {
        OverflowPolicy::Reject
    } else {
        OverflowPolicy::Queue { max_pending: queue }
    };
    let options = ListenerOptions::new()
        .max_associations(max_associations)
        .overflow(overflow)
        .timeouts(timeouts);
    let options = if any_called_ae_title {
        options.default_application(scp, VerificationHandler::default)
    } else {
        options.application(scp, VerificationHandler::default)
    };

    let listen_addr = SocketAddrV4::new(Ipv4Addr::from(0), port);
    let listener = options
        .bind(listen_addr)
        .await
        .whatever_context("Could not start listener")?;
    info!("listening on: tcp://{}", listener.local_addr());
    let handle = listener.spawn();

    tokio::signal::ctrl_c()
        .await
        .whatever_context("Could not wait for the interrupt signal")?;
    info!(
        "Shutting down, {} association(s) still active",
        handle.active_associations()
    );
    handle
        .shutdown()
        .await
        .whatever_context("Listener failed")?;
    Ok(())
}
