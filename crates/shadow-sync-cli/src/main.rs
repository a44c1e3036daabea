//! # Shadow Sync CLI
//!
//! Command-line utilities for inspecting shadow topics and documents.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use shadow_sync_core::CorrelationTracker;
use shadow_sync_proto::{
    DocumentCodec, JsonCodec, ShadowDocument, ShadowTopics, TopicKind, TopicRouter,
};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "topics" => {
            let Some((thing, shadow)) = thing_and_shadow(&args[2..]) else {
                eprintln!("Usage: shadow-sync topics <thing> [--shadow <name>]");
                std::process::exit(1);
            };
            let topics = ShadowTopics::new(thing, shadow).context("Invalid name")?;
            for kind in TopicKind::ALL {
                println!("{:<16} {}", kind.suffix(), topics.topic(kind));
            }
        }
        "classify" => {
            if args.len() < 3 {
                eprintln!("Usage: shadow-sync classify <topic>");
                std::process::exit(1);
            }
            let matched = TopicRouter::default().classify(&args[2]);
            println!("type:   {:?}", matched.message_type);
            if let Some(thing) = matched.thing_name {
                println!("thing:  {thing}");
            }
            if let Some(shadow) = matched.shadow_name {
                println!("shadow: {shadow}");
            }
        }
        "token" => {
            println!("{}", CorrelationTracker::new().issue());
        }
        "desired" | "reported" => {
            if args.len() < 3 {
                eprintln!("Usage: shadow-sync {} <json>", args[1]);
                std::process::exit(1);
            }
            let state: Value = serde_json::from_str(&args[2]).context("Invalid state JSON")?;
            let token = CorrelationTracker::new().issue().to_string();
            let document = if args[1] == "desired" {
                ShadowDocument::desired(state, token)
            } else {
                ShadowDocument::reported(state, token)
            };
            let payload = JsonCodec.encode(&document).context("Failed to encode")?;
            println!("{}", String::from_utf8_lossy(&payload));
        }
        "decode" => {
            if args.len() < 3 {
                eprintln!("Usage: shadow-sync decode <json>");
                std::process::exit(1);
            }
            decode(&args[2])?;
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

/// `<thing> [--shadow <name>]`
fn thing_and_shadow(args: &[String]) -> Option<(&str, Option<&str>)> {
    match args {
        [thing] => Some((thing.as_str(), None)),
        [thing, flag, shadow] if flag == "--shadow" => Some((thing.as_str(), Some(shadow.as_str()))),
        _ => None,
    }
}

fn decode(payload: &str) -> Result<()> {
    let codec = JsonCodec;
    let value: Value = serde_json::from_str(payload).context("Invalid JSON")?;

    if value.get("code").is_some() {
        let error = codec
            .decode_error(payload.as_bytes())
            .context("Failed to decode error response")?;
        println!("error:  {} {}", error.code, error.message);
        if let Some(token) = error.client_token {
            println!("token:  {token}");
        }
        return Ok(());
    }

    if !value.is_object() {
        bail!("shadow documents are JSON objects");
    }

    let document = codec
        .decode(payload.as_bytes())
        .context("Failed to decode document")?;
    if let Some(token) = document.client_token() {
        println!("token:    {token}");
    }
    if let Some(version) = document.version {
        println!("version:  {version}");
    }
    if let Some(desired) = &document.state.desired {
        println!("desired:  {desired}");
    }
    if let Some(reported) = &document.state.reported {
        println!("reported: {reported}");
    }
    let delta = document.delta();
    if delta.as_object().is_some_and(|fields| !fields.is_empty()) {
        println!("delta:    {delta}");
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"Shadow Sync CLI

USAGE:
    shadow-sync <COMMAND> [OPTIONS]

COMMANDS:
    topics <thing> [--shadow <name>]  List the shadow topics for a thing
    classify <topic>                  Classify a topic as a shadow response
    token                             Issue a correlation token
    desired <json>                    Build a desired-state update document
    reported <json>                   Build a reported-state update document
    decode <json>                     Decode a shadow document or error response
    help                              Show this help message

EXAMPLES:
    shadow-sync topics lamp --shadow light
    shadow-sync classify '$aws/things/lamp/shadow/update/delta'
    shadow-sync desired '{{"powerOn":1}}'
"#
    );
}
