use std::env;
use std::sync::Arc;
use std::time::Duration;

use codeorb::sink::ChannelSink;
use codeorb::{Config, EngineBuilder};
use log::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let device = env::args().nth(1).unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let (sink, receiver) = ChannelSink::new();

    let engine = EngineBuilder::new(Config::new(&device))
        .with_serial(&device)
        .with_sink(Arc::new(sink))
        .build()?;
    let handle = engine.handle();

    info!("codeorb-demo attached to {device}");

    let id = handle.command_send("status").expect("queue has room");

    loop {
        for line in receiver.drain_logs() {
            println!("log: {line}");
        }
        if let Some(payload) = receiver.latest_proc() {
            if handle.content_proc_changed() {
                println!("proc ({} bytes): {}", payload.len(), String::from_utf8_lossy(&payload));
            }
        }
        if let Some(response) = handle.command_response_get(id) {
            match response {
                Some(text) => println!("status -> {text}"),
                None => println!("status -> (abandoned, target unreachable)"),
            }
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    Ok(())
}
