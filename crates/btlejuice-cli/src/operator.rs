//! Line-oriented operator prompt
//!
//! Suspended edits are printed with their payload in hex. While an edit is shown:
//! an empty line forwards it unchanged, `d` discards it, anything else is read as the
//! replacement payload in hex. Commands available at any time: `:i` interactive mode,
//! `:f` forward mode, `:s` proxy status, `:q` quit.

use btlejuice_core::intercept::{Mode, PendingEdit, Resolution};
use btlejuice_core::{InterceptEvent, OperatorCommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub async fn run(
    mut events: mpsc::Receiver<InterceptEvent>,
    commands: mpsc::Sender<OperatorCommand>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut current: Option<PendingEdit> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let InterceptEvent::Edit(edit) = &event {
                    current = Some(edit.clone());
                }
                print_event(&event);
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        let _ = commands.send(OperatorCommand::Stop).await;
                        break;
                    }
                };
                match parse_line(&line, current.as_ref()) {
                    Ok(Some(command)) => {
                        if matches!(command, OperatorCommand::Resolve(_)) {
                            current = None;
                        }
                        let quit = matches!(command, OperatorCommand::Stop);
                        if commands.send(command).await.is_err() || quit {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("⚠️  {}", message),
                }
            }
        }
    }
}

fn print_event(event: &InterceptEvent) {
    match event {
        InterceptEvent::Profile(profile) => println!(
            "📋 Cloned {} ({}), {} services",
            profile.address,
            profile.name.as_deref().unwrap_or("unnamed"),
            profile.attribute_tree.services().len()
        ),
        InterceptEvent::Ready(true) => println!("✅ Proxy ready, waiting for a central"),
        InterceptEvent::Ready(false) => println!("❌ Proxy could not reach the target"),
        InterceptEvent::Status(state) => println!("Status: {}", state),
        InterceptEvent::CentralConnected(address) => println!("🔗 Central {} connected", address),
        InterceptEvent::CentralDisconnected(address) => {
            println!("🔌 Central {} disconnected", address);
        }
        InterceptEvent::Edit(edit) => {
            println!(
                "✏️  {} {}:{} [{}]",
                edit.operation,
                edit.service,
                edit.characteristic,
                hex::encode(&edit.data)
            );
            println!("   <enter> forward, d discard, or new hex payload");
        }
        InterceptEvent::CloneFailed(reason) => println!("❌ Cannot emulate the device: {}", reason),
        InterceptEvent::TargetLost(address) => println!("⚠️  Device {} disconnected", address),
        InterceptEvent::Stopped => println!("⏹️  Proxy stopped"),
    }
}

fn parse_line(line: &str, current: Option<&PendingEdit>) -> Result<Option<OperatorCommand>, String> {
    let line = line.trim();
    match line {
        ":q" => return Ok(Some(OperatorCommand::Stop)),
        ":i" => return Ok(Some(OperatorCommand::SetMode(Mode::Interactive))),
        ":f" => return Ok(Some(OperatorCommand::SetMode(Mode::Forward))),
        ":s" => return Ok(Some(OperatorCommand::Status)),
        _ => {}
    }

    let Some(edit) = current else {
        if line.is_empty() {
            return Ok(None);
        }
        return Err("no operation is waiting for an edit".to_string());
    };

    let resolution = match line {
        "" => Resolution::Forward(edit.data.clone()),
        "d" | "D" => Resolution::Discard,
        hex_payload => {
            let cleaned: String = hex_payload.split_whitespace().collect();
            let data = hex::decode(&cleaned).map_err(|e| format!("invalid hex: {}", e))?;
            Resolution::Forward(data)
        }
    };
    Ok(Some(OperatorCommand::Resolve(resolution)))
}
