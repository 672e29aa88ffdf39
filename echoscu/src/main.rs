use std::time::Duration;

use clap::Parser;
use dicom_ulp::address::validate_ae_title;
use dicom_ulp::association::{ClientAssociationOptions, Timeouts};
use dicom_ulp::dimse::{Command, DimseMessage, StatusType};
use dicom_ulp::uids::VERIFICATION;
use snafu::{whatever, OptionExt, Report, ResultExt, Whatever};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// DICOM C-ECHO SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to SCP,
    /// optionally with AE title
    /// (example: "ECHO-SCP@127.0.0.1:104")
    addr: String,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the C-ECHO message ID
    #[arg(short = 'm', long = "message-id", default_value = "1")]
    message_id: u16,
    /// the number of C-ECHO requests to send
    #[arg(short = 'r', long = "repeat", default_value = "1")]
    repeat: u16,
    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "ECHO-SCU", value_parser = parse_ae_title)]
    calling_ae_title: String,
    /// the called AE title, overrides AE title in address if present [default: ANY-SCP]
    #[arg(long = "called-ae-title", value_parser = parse_ae_title)]
    called_ae_title: Option<String>,
    /// the maximum PDU length accepted by the SCU
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// fail if an incoming PDU is longer than the maximum PDU length
    #[arg(short = 's', long = "strict")]
    strict: bool,
    /// seconds to wait for the association response
    #[arg(long = "accept-timeout", default_value = "30")]
    accept_timeout: u64,
    /// seconds to wait for each C-ECHO response
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

    let runtime = tokio::runtime::Builder::new_current_thread()
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
        addr,
        verbose: _,
        message_id,
        repeat,
        calling_ae_title,
        called_ae_title,
        max_pdu_length,
        strict,
        accept_timeout,
        dimse_timeout,
    } = app;

    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title)
        .with_abstract_syntax(VERIFICATION)
        .max_pdu_length(max_pdu_length)
        .strict(strict)
        .timeouts(Timeouts {
            accept: Some(Duration::from_secs(accept_timeout)),
            dimse: Some(Duration::from_secs(dimse_timeout)),
            ..Timeouts::default()
        });
    if let Some(called_ae_title) = called_ae_title {
        options = options.called_ae_title(called_ae_title);
    }

    let mut association = options
        .establish_with(&addr)
        .await
        .whatever_context("Could not establish association")?;
    info!("Association with {} successful", addr);

    let pc_id = association
        .parameters()
        .accepted_context_for(VERIFICATION)
        .map(|pc| pc.id)
        .whatever_context("Verification SOP class was not accepted")?;

    let mut failures = 0;
    for i in 0..repeat {
        let id = message_id.wrapping_add(i);
        let request = DimseMessage::new(pc_id, Command::echo_rq(id));
        info!("Echo message sent (msg id {}), awaiting reply...", id);
        let response = association
            .request(&request)
            .await
            .whatever_context("C-ECHO failed")?;
        match response.command.status_type() {
            Some(StatusType::Success) => info!("C-ECHO successful."),
            _ => {
                warn!("C-ECHO answered with {}", response.command);
                failures += 1;
            }
        }
    }

    association
        .release()
        .await
        .whatever_context("Could not release association")?;

    if failures > 0 {
        whatever!("{} of {} C-ECHO requests failed", failures, repeat);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::App;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        App::command().debug_assert();
    }
}
