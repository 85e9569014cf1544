//! Interactive client binary.
//!
//! Usage: `client <BRANCH_NAME> <CONFIG_FILE>`
//!
//! Reads one command per line from standard input. `BEGIN` opens the
//! session: a coordinator branch is picked at random from the roster (the
//! branch-name argument is accepted for symmetry but does not steer
//! routing) and a single transaction id is stamped from the wall clock.
//! The session ends at the first terminal reply.

use std::io::BufRead;
use std::path::Path;

use anyhow::Context;
use env_logger::Env;
use log::debug;
use rand::Rng;
use tokio::net::TcpStream;

use teller::config::{self, Branch};
use teller::wire::{self, reply, Hello, OpKind, Operation};
use teller::TxnId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: client <BRANCH_NAME> <CONFIG_FILE>");
        std::process::exit(1);
    }
    let config_path = Path::new(&args[2]);
    let roster = config::load_roster(config_path)
        .with_context(|| format!("loading roster from {}", config_path.display()))?;

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    // Everything before BEGIN is ignored.
    loop {
        let Some(line) = lines.next() else {
            return Ok(());
        };
        if line?.trim() == "BEGIN" {
            break;
        }
    }
    println!("OK");

    let mut stream = connect_to_coordinator(&roster).await;
    wire::write_frame(&mut stream, &Hello::Client).await?;
    let txn_id = TxnId::now();
    debug!("session transaction id {txn_id}");

    for line in lines {
        let line = line?;
        let Some(op) = parse_command(&line, txn_id) else {
            if !line.trim().is_empty() {
                eprintln!("unrecognized command: {line}");
            }
            continue;
        };
        wire::write_frame(&mut stream, &op).await?;
        let answer: String = wire::read_frame(&mut stream)
            .await
            .context("lost connection to coordinator")?;
        println!("{answer}");
        if reply::is_terminal(&answer) {
            return Ok(());
        }
    }
    Ok(())
}

/// Dials a uniformly random roster entry until one accepts.
async fn connect_to_coordinator(roster: &[Branch]) -> TcpStream {
    loop {
        let pick = rand::thread_rng().gen_range(0..roster.len());
        let coordinator = &roster[pick];
        match TcpStream::connect(coordinator.addr()).await {
            Ok(stream) => {
                debug!("connected to coordinator {}", coordinator.name);
                return stream;
            }
            Err(e) => debug!("coordinator {} unreachable: {e}", coordinator.name),
        }
    }
}

/// Parses one command line into a wire operation. Returns `None` for
/// malformed input, which the session treats as a no-op.
fn parse_command(line: &str, txn_id: TxnId) -> Option<Operation> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    let op = match verb {
        "COMMIT" => Operation::commit(txn_id),
        "ABORT" => Operation::abort(txn_id),
        "BALANCE" => {
            let (branch, account) = split_target(parts.next()?)?;
            Operation {
                kind: OpKind::Balance,
                branch,
                account,
                amount: 0,
                txn_id,
            }
        }
        "DEPOSIT" | "WITHDRAW" => {
            let (branch, account) = split_target(parts.next()?)?;
            let amount: i64 = parts.next()?.parse().ok()?;
            if amount < 0 {
                return None;
            }
            let kind = if verb == "DEPOSIT" {
                OpKind::Deposit
            } else {
                OpKind::Withdraw
            };
            Operation {
                kind,
                branch,
                account,
                amount,
                txn_id,
            }
        }
        _ => return None,
    };
    Some(op)
}

/// Splits `branch.account` into its parts.
fn split_target(target: &str) -> Option<(String, String)> {
    let (branch, account) = target.split_once('.')?;
    if branch.is_empty() || account.is_empty() {
        return None;
    }
    Some((branch.to_string(), account.to_string()))
}
