//! Admin surface: a line protocol on the client port.
//!
//! One command per line, `CLUSTER <SUBCOMMAND> [args...]`, answered with
//! either a single `OK`/value line or a multi-line block (INFO, NODES).
//! Every response is terminated by an empty line so clients can frame
//! multi-line bodies. Errors come back as `ERR <reason>`. Parsing happens
//! here; execution happens on the driver loop, one command at a time.

use grapevine_cluster::{NodeId, SLOT_COUNT};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::runtime::{AdminCommand, AdminRequest};

pub fn spawn_listener(listener: TcpListener, requests: mpsc::Sender<AdminRequest>) {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "admin accept failed");
                    continue;
                }
            };
            debug!(%peer, "admin connection opened");
            tokio::spawn(serve(stream, requests.clone()));
        }
    });
}

async fn serve(stream: TcpStream, requests: mpsc::Sender<AdminRequest>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match parse_command(&line) {
            Ok(command) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let request = AdminRequest {
                    command,
                    reply: reply_tx,
                };
                if requests.send(request).await.is_err() {
                    return;
                }
                match reply_rx.await {
                    Ok(Ok(body)) => body,
                    Ok(Err(reason)) => format!("ERR {reason}"),
                    Err(_) => return,
                }
            }
            Err(reason) => format!("ERR {reason}"),
        };
        let mut out = response;
        if !out.ends_with('\n') {
            out.push_str("\r\n");
        }
        // empty line terminates the response
        out.push_str("\r\n");
        if write_half.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Parses one admin line into a command.
pub fn parse_command(line: &str) -> Result<AdminCommand, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [head, rest @ ..] = tokens.as_slice() else {
        return Err("empty command".to_string());
    };
    if !head.eq_ignore_ascii_case("cluster") {
        return Err(format!("unknown command '{head}'"));
    }
    let [sub, args @ ..] = rest else {
        return Err("missing CLUSTER subcommand".to_string());
    };
    match sub.to_ascii_lowercase().as_str() {
        "meet" => match args {
            [ip, port] => Ok(AdminCommand::Meet {
                ip: (*ip).to_string(),
                port: parse_port(port)?,
                cport: None,
            }),
            [ip, port, cport] => Ok(AdminCommand::Meet {
                ip: (*ip).to_string(),
                port: parse_port(port)?,
                cport: Some(parse_port(cport)?),
            }),
            _ => Err("usage: CLUSTER MEET <ip> <port> [bus-port]".to_string()),
        },
        "forget" => match args {
            [id] => {
                let node: NodeId = id.parse().map_err(|_| format!("invalid node id '{id}'"))?;
                Ok(AdminCommand::Forget { node })
            }
            _ => Err("usage: CLUSTER FORGET <node-id>".to_string()),
        },
        "addslots" => Ok(AdminCommand::AddSlots {
            slots: parse_slots(args)?,
        }),
        "delslots" => Ok(AdminCommand::DelSlots {
            slots: parse_slots(args)?,
        }),
        "bumpepoch" if args.is_empty() => Ok(AdminCommand::BumpEpoch),
        "reset" => match args {
            [] => Ok(AdminCommand::Reset { hard: false }),
            [mode] if mode.eq_ignore_ascii_case("soft") => Ok(AdminCommand::Reset { hard: false }),
            [mode] if mode.eq_ignore_ascii_case("hard") => Ok(AdminCommand::Reset { hard: true }),
            _ => Err("usage: CLUSTER RESET [SOFT|HARD]".to_string()),
        },
        "info" if args.is_empty() => Ok(AdminCommand::Info),
        "nodes" if args.is_empty() => Ok(AdminCommand::Nodes),
        "myid" if args.is_empty() => Ok(AdminCommand::MyId),
        other => Err(format!("unknown CLUSTER subcommand '{other}'")),
    }
}

fn parse_port(token: &str) -> Result<u16, String> {
    token
        .parse::<u16>()
        .map_err(|_| format!("invalid port '{token}'"))
}

/// Accepts single slots and inclusive `start-end` ranges.
fn parse_slots(args: &[&str]) -> Result<Vec<u16>, String> {
    if args.is_empty() {
        return Err("no slots given".to_string());
    }
    let mut slots = Vec::new();
    for arg in args {
        match arg.split_once('-') {
            Some((start, end)) => {
                let start = parse_slot(start)?;
                let end = parse_slot(end)?;
                if start > end {
                    return Err(format!("invalid slot range '{arg}'"));
                }
                slots.extend(start..=end);
            }
            None => slots.push(parse_slot(arg)?),
        }
    }
    Ok(slots)
}

fn parse_slot(token: &str) -> Result<u16, String> {
    let slot = token
        .parse::<u16>()
        .map_err(|_| format!("invalid slot '{token}'"))?;
    if slot as usize >= SLOT_COUNT {
        return Err(format!("slot {slot} out of range"));
    }
    Ok(slot)
}
