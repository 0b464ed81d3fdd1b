//! # MTConnect CLI
//!
//! Command-line utilities for inspecting topics, payloads, and agent identity.

use anyhow::{Context, Result};
use mtconnect_core::identity::IDENTITY_FILENAME;
use mtconnect_core::{AgentIdentity, AssetKey};
use mtconnect_proto::{decode_record, PayloadFormat, Record, TopicScheme};
use std::env;
use std::path::PathBuf;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "classify" => {
            if args.len() < 3 {
                eprintln!("Usage: mtconnect classify <topic>");
                std::process::exit(1);
            }
            match TopicScheme::default().classify(&args[2]) {
                Some((device_uuid, kind)) => println!("{kind:?} {device_uuid}"),
                None => {
                    println!("unmatched");
                    std::process::exit(2);
                }
            }
        }
        "decode" => {
            if args.len() < 4 {
                eprintln!("Usage: mtconnect decode <topic> <json-payload>");
                std::process::exit(1);
            }
            let (device_uuid, kind) = TopicScheme::default()
                .classify(&args[2])
                .with_context(|| format!("Unmatched topic: {}", args[2]))?;
            let record = decode_record(kind, PayloadFormat::Json, &device_uuid, args[3].as_bytes())
                .context("Failed to decode payload")?;
            print_record(&record)?;
        }
        "asset-key" => {
            if args.len() < 3 {
                eprintln!("Usage: mtconnect asset-key <assetId>");
                std::process::exit(1);
            }
            println!("{}", AssetKey::from_asset_id(&args[2]));
        }
        "identity" => {
            let path = args
                .get(2)
                .map_or_else(|| PathBuf::from(IDENTITY_FILENAME), PathBuf::from);
            let identity = AgentIdentity::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            println!("uuid:         {}", identity.uuid);
            println!("changeToken:  {}", identity.change_token);
            println!("componentId:  {}", identity.component_id());
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_record(record: &Record) -> Result<()> {
    let json = match record {
        Record::Device(device) => serde_json::to_string_pretty(device)?,
        Record::Observations(observations) | Record::Conditions(observations) => {
            serde_json::to_string_pretty(observations)?
        }
        Record::Asset(asset) => serde_json::to_string_pretty(asset)?,
    };
    println!("{json}");
    Ok(())
}

fn print_help() {
    println!(
        r#"MTConnect CLI

USAGE:
    mtconnect <COMMAND> [OPTIONS]

COMMANDS:
    classify <topic>           Classify an MQTT topic (kind and device uuid)
    decode <topic> <payload>   Decode a JSON payload received on a topic
    asset-key <assetId>        Print the storage key of an asset id
    identity [path]            Show the agent identity (default: agent.information.json)
    help                       Show this help message

EXAMPLES:
    mtconnect classify "MTConnect/Devices/mill-1/Observations/logic/Conditions"
    mtconnect asset-key "TOOL-7"
    mtconnect decode "MTConnect/Devices/mill-1/Observations" '{{"dataItemId":"x","category":"SAMPLE","type":"POSITION","timestamp":"2024-01-01T00:00:00Z","result":1}}'
"#
    );
}
