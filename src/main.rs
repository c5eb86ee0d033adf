// ABOUTME: Main entry point for stdb-probe, a frame and config inspection tool
//
// Binary: stdb-probe
// Usage: stdb-probe <COMMAND>
// - decode: hex frame to value tree
// - subscribe-frame: queries to subscribe frame hex
// - check-config: validate a client config file

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Commands, OutputFormat};

fn main() -> Result<()> {
    let args = Cli::parse();
    log_subscriber(&args.log_level, args.format, std::io::stderr).init();

    match &args.command {
        Commands::Decode(decode_args) => cli::decode::execute(decode_args, args.format),
        Commands::SubscribeFrame(frame_args) => cli::frame::execute(frame_args, args.format),
        Commands::CheckConfig(config_args) => cli::check_config::execute(config_args, args.format),
    }
}

/// Logs follow the output format: JSON lines under `--format json`.
fn log_subscriber<W>(filter: &str, format: OutputFormat, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Clone + Send + Sync + 'static,
{
    let json = matches!(format, OutputFormat::Json);
    let text_layer = (!json).then(|| fmt::layer().with_target(true).with_writer(writer.clone()));
    let json_layer = json.then(|| fmt::layer().json().with_target(true).with_writer(writer));

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(EnvFilter::try_new(filter).unwrap_or_else(|_| "stdb_client=info".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn emit(format: OutputFormat) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = log_subscriber("info", format, move || writer.clone());
        tracing::subscriber::with_default(subscriber, || tracing::info!(frames = 3, "Decoded frame"));
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_json_format_logs_json_lines() {
        let output = emit(OutputFormat::Json);
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["fields"]["message"], "Decoded frame");
        assert_eq!(line["fields"]["frames"], 3);
    }

    #[test]
    fn test_text_format_logs_plain_lines() {
        let output = emit(OutputFormat::Text);
        assert!(output.contains("Decoded frame"));
        assert!(serde_json::from_str::<serde_json::Value>(output.trim()).is_err());
    }
}
