// ABOUTME: CLI subscribe-frame command - print the frames a subscribe call would send

use anyhow::{bail, Result};
use serde::Serialize;

use stdb_client::protocol::{ClientMessage, QueryId, RequestId};
use stdb_client::subscription::{choose_strategy, validate, SubscriptionStrategy};

use super::decode::to_hex;
use super::{FrameArgs, OutputFormat};

/// One frame as printed.
#[derive(Debug, Serialize)]
pub struct FrameInfo {
    pub request_id: u32,
    pub bytes: usize,
    pub hex: String,
}

pub fn execute(args: &FrameArgs, format: OutputFormat) -> Result<()> {
    let errors = validate(&args.queries);
    if !errors.is_empty() {
        for err in &errors {
            eprintln!("{err}");
        }
        bail!("{} invalid quer{}", errors.len(), if errors.len() == 1 { "y" } else { "ies" });
    }

    let strategy_override = if args.multi {
        Some(SubscriptionStrategy::MultiQuery)
    } else if args.single {
        Some(SubscriptionStrategy::SingleQuery)
    } else {
        None
    };
    let strategy = choose_strategy(args.queries.len(), args.threshold, strategy_override);
    let frames = build_frames(&args.queries, strategy, args.request_id, QueryId::new(args.query_id))?;

    match format {
        OutputFormat::Text => {
            println!("strategy: {strategy}");
            for frame in &frames {
                println!("request {} ({} bytes): {}", frame.request_id, frame.bytes, frame.hex);
            }
        }
        OutputFormat::Json => {
            let out = serde_json::json!({ "strategy": strategy, "frames": frames });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

/// Encode subscribe frames, numbering request ids upward from `first_request_id`.
pub fn build_frames(
    queries: &[String],
    strategy: SubscriptionStrategy,
    first_request_id: u32,
    query_id: QueryId,
) -> Result<Vec<FrameInfo>> {
    let messages: Vec<ClientMessage> = match strategy {
        SubscriptionStrategy::SingleQuery => queries
            .iter()
            .zip(first_request_id..)
            .map(|(query, id)| ClientMessage::SubscribeSingle {
                query: query.clone(),
                request_id: RequestId::new(id),
                query_id,
            })
            .collect(),
        SubscriptionStrategy::MultiQuery => vec![ClientMessage::SubscribeMulti {
            query_strings: queries.to_vec(),
            request_id: RequestId::new(first_request_id),
            query_id,
        }],
    };

    messages
        .iter()
        .map(|message| {
            let bytes = message.encode()?;
            Ok(FrameInfo {
                request_id: message.request_id().get(),
                bytes: bytes.len(),
                hex: to_hex(&bytes),
            })
        })
        .collect()
}
