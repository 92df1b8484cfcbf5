use std::{env, fs, path::Path, process};

use base64::{engine::general_purpose, Engine as _};
use serde_json::json;

use token_core::address::Address;
use token_core::amount::TokenAmount;
use token_core::engine::{Engine, EngineSnapshot, ReceiptOutcome};
use token_core::message::{message_builder, ExecReturn, MessageBuilder, MsgId};
use token_core::state::{TokenInfo, VERSION_1};

const DEFAULT_STATE: &str = "tokenchain.json";

fn usage() -> ! {
    eprintln!(
        "Usage:
  token create      --from=<addr> --name=<str> --symbol=<str> --decimals=<n> --supply=<amount> [--icon-b64=<b64>] [--state=<file>]
  token info        --ledger=<addr> [--state=<file>]
  token balance     --ledger=<addr> --holder=<addr> [--state=<file>]
  token holders     --ledger=<addr> [--state=<file>]
  token delegations --ledger=<addr> [--holder=<addr>] [--state=<file>]
  token transfer    --ledger=<addr> --from=<addr> --to=<addr> --amount=<amount> [--state=<file>]
  token approve     --ledger=<addr> --from=<addr> --spender=<addr> --amount=<amount> [--state=<file>]
  token transfer-from --ledger=<addr> --from=<addr> --holder=<addr> --to=<addr> --amount=<amount> [--state=<file>]

Notes:
  - addresses are t0<id> (numeric) or t1<name> (lowercase key name)
  - amounts are whole-number strings in the token's smallest unit
  - the toy chain is persisted as JSON in --state (default {DEFAULT_STATE})"
    );
    process::exit(1)
}

fn arg_flag(args: &[String], name: &str) -> Option<String> {
    for a in args {
        if let Some(rest) = a.strip_prefix(&format!("--{}=", name)) {
            return Some(rest.to_string());
        }
    }
    None
}

fn require_flag(args: &[String], name: &str) -> String {
    if let Some(v) = arg_flag(args, name) {
        return v;
    }
    eprintln!("error: missing --{name}\n");
    usage();
}

fn fail(msg: &str) -> ! {
    eprintln!("error: {msg}");
    process::exit(2)
}

fn parse_address(name: &str, value: &str) -> Address {
    match value.parse() {
        Ok(addr) => addr,
        Err(err) => fail(&format!("invalid {name}: {err}")),
    }
}

fn parse_amount(name: &str, value: &str) -> TokenAmount {
    match value.parse() {
        Ok(amount) => amount,
        Err(err) => fail(&format!("invalid {name}: {err}")),
    }
}

fn load_engine(path: &str) -> Engine {
    if !Path::new(path).exists() {
        return Engine::new();
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => fail(&format!("cannot read {path}: {err}")),
    };
    let snapshot: EngineSnapshot = match serde_json::from_str(&raw) {
        Ok(s) => s,
        Err(err) => fail(&format!("cannot parse {path}: {err}")),
    };
    match Engine::restore(snapshot) {
        Ok(engine) => engine,
        Err(err) => fail(&format!("cannot restore chain from {path}: {err}")),
    }
}

fn save_engine(path: &str, engine: &Engine) {
    let snapshot = match engine.snapshot() {
        Ok(s) => s,
        Err(err) => fail(&format!("cannot snapshot chain: {err}")),
    };
    let raw = match serde_json::to_string_pretty(&snapshot) {
        Ok(raw) => raw,
        Err(err) => fail(&format!("cannot encode chain: {err}")),
    };
    if let Err(err) = fs::write(path, raw) {
        fail(&format!("cannot write {path}: {err}"));
    }
}

fn builder_for(from: &Address) -> Box<dyn MessageBuilder> {
    match message_builder(VERSION_1, from.clone()) {
        Ok(b) => b,
        Err(err) => fail(&format!("{err}")),
    }
}

/// Print the receipt verdict; exit non-zero on a rejected transaction.
fn report_receipt(engine: &Engine, id: &MsgId) -> Option<Vec<u8>> {
    let Some(receipt) = engine.receipt(id) else {
        fail(&format!("no receipt for message {id}"));
    };
    match &receipt.outcome {
        ReceiptOutcome::Accepted { ret } => {
            println!("transaction succeeded (message {id}, nonce {})", receipt.nonce);
            Some(ret.clone())
        }
        ReceiptOutcome::Rejected { code, reason } => {
            eprintln!("transaction failed; exit code {code}: {reason}");
            None
        }
    }
}

fn display_addr(engine: &Engine, addr: &Address) -> String {
    match engine.account_key(addr) {
        Some(key) => format!("{key} ({addr})"),
        None => addr.to_string(),
    }
}

fn cmd_create(args: &[String]) {
    let state_path = arg_flag(args, "state").unwrap_or_else(|| DEFAULT_STATE.into());
    let from = parse_address("from", &require_flag(args, "from"));
    let supply = parse_amount("supply", &require_flag(args, "supply"));
    let decimals = match require_flag(args, "decimals").parse::<u64>() {
        Ok(d) => d,
        Err(err) => fail(&format!("invalid decimals: {err}")),
    };
    let icon = match arg_flag(args, "icon-b64") {
        Some(b64) => match general_purpose::STANDARD.decode(b64.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => fail(&format!("invalid icon-b64: {err}")),
        },
        None => Vec::new(),
    };
    let info = TokenInfo {
        name: require_flag(args, "name"),
        symbol: require_flag(args, "symbol"),
        decimals,
        total_supply: supply,
        icon,
        issuer: from.clone(),
    };
    let msg = match builder_for(&from).create(&info) {
        Ok(msg) => msg,
        Err(err) => fail(&format!("{err}")),
    };

    let mut engine = load_engine(&state_path);
    let id = match engine.push(msg) {
        Ok(id) => id,
        Err(err) => fail(&format!("{err}")),
    };
    save_engine(&state_path, &engine);

    if let Some(ret) = report_receipt(&engine, &id) {
        match serde_cbor::from_slice::<ExecReturn>(&ret) {
            Ok(exec) => println!("ledger address: {}", exec.actor),
            Err(err) => fail(&format!("undecodable exec return: {err}")),
        }
    } else {
        process::exit(3);
    }
}

fn cmd_info(args: &[String]) {
    let state_path = arg_flag(args, "state").unwrap_or_else(|| DEFAULT_STATE.into());
    let ledger = parse_address("ledger", &require_flag(args, "ledger"));
    let engine = load_engine(&state_path);
    let state = match engine.state(&ledger) {
        Ok(s) => s,
        Err(err) => fail(&format!("{err}")),
    };
    let info = state.info();
    let out = json!({
        "name": info.name,
        "symbol": info.symbol,
        "decimals": info.decimals,
        "totalSupply": info.total_supply.to_string(),
        "issuer": display_addr(&engine, &info.issuer),
        "iconB64": general_purpose::STANDARD.encode(&info.icon),
    });
    match serde_json::to_string_pretty(&out) {
        Ok(s) => println!("{s}"),
        Err(err) => fail(&format!("{err}")),
    }
}

fn cmd_balance(args: &[String]) {
    let state_path = arg_flag(args, "state").unwrap_or_else(|| DEFAULT_STATE.into());
    let ledger = parse_address("ledger", &require_flag(args, "ledger"));
    let holder = parse_address("holder", &require_flag(args, "holder"));
    let engine = load_engine(&state_path);
    let state = match engine.state(&ledger) {
        Ok(s) => s,
        Err(err) => fail(&format!("{err}")),
    };
    // Unallocated holders simply have a zero balance.
    let resolved = engine.resolve_id(&holder).unwrap_or(holder);
    match state.balance_of(&resolved) {
        Ok(balance) => println!("{balance}"),
        Err(err) => fail(&format!("{err}")),
    }
}

fn cmd_holders(args: &[String]) {
    let state_path = arg_flag(args, "state").unwrap_or_else(|| DEFAULT_STATE.into());
    let ledger = parse_address("ledger", &require_flag(args, "ledger"));
    let engine = load_engine(&state_path);
    let state = match engine.state(&ledger) {
        Ok(s) => s,
        Err(err) => fail(&format!("{err}")),
    };
    let iter = match state.holders() {
        Ok(iter) => iter,
        Err(err) => fail(&format!("{err}")),
    };
    for entry in iter {
        match entry {
            Ok((holder, balance)) => {
                println!("{}\t{balance}", display_addr(&engine, &holder))
            }
            Err(err) => fail(&format!("{err}")),
        }
    }
}

fn cmd_delegations(args: &[String]) {
    let state_path = arg_flag(args, "state").unwrap_or_else(|| DEFAULT_STATE.into());
    let ledger = parse_address("ledger", &require_flag(args, "ledger"));
    let engine = load_engine(&state_path);
    let state = match engine.state(&ledger) {
        Ok(s) => s,
        Err(err) => fail(&format!("{err}")),
    };

    if let Some(holder) = arg_flag(args, "holder") {
        let holder = parse_address("holder", &holder);
        let resolved = engine.resolve_id(&holder).unwrap_or(holder);
        match state.approvals_by(&resolved) {
            Ok(approvals) => {
                for (spender, amount) in approvals {
                    println!("{}\t{amount}", display_addr(&engine, &spender));
                }
            }
            Err(err) => fail(&format!("{err}")),
        }
        return;
    }

    let iter = match state.approvals() {
        Ok(iter) => iter,
        Err(err) => fail(&format!("{err}")),
    };
    for entry in iter {
        match entry {
            Ok((holder, spender, amount)) => println!(
                "{}\t{}\t{amount}",
                display_addr(&engine, &holder),
                display_addr(&engine, &spender)
            ),
            Err(err) => fail(&format!("{err}")),
        }
    }
}

fn cmd_mutate(args: &[String], kind: &str) {
    let state_path = arg_flag(args, "state").unwrap_or_else(|| DEFAULT_STATE.into());
    let ledger = parse_address("ledger", &require_flag(args, "ledger"));
    let from = parse_address("from", &require_flag(args, "from"));
    let amount = parse_amount("amount", &require_flag(args, "amount"));
    let builder = builder_for(&from);

    let msg = match kind {
        "transfer" => {
            let to = parse_address("to", &require_flag(args, "to"));
            builder.transfer(&ledger, &to, &amount)
        }
        "approve" => {
            let spender = parse_address("spender", &require_flag(args, "spender"));
            builder.approve(&ledger, &spender, &amount)
        }
        "transfer-from" => {
            let holder = parse_address("holder", &require_flag(args, "holder"));
            let to = parse_address("to", &require_flag(args, "to"));
            builder.transfer_from(&ledger, &holder, &to, &amount)
        }
        _ => unreachable!(),
    };
    let msg = match msg {
        Ok(msg) => msg,
        Err(err) => fail(&format!("{err}")),
    };

    let mut engine = load_engine(&state_path);
    let id = match engine.push(msg) {
        Ok(id) => id,
        Err(err) => fail(&format!("{err}")),
    };
    save_engine(&state_path, &engine);
    if report_receipt(&engine, &id).is_none() {
        process::exit(3);
    }
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(cmd) = args.first() else { usage() };
    let rest = &args[1..];
    match cmd.as_str() {
        "create" => cmd_create(rest),
        "info" => cmd_info(rest),
        "balance" => cmd_balance(rest),
        "holders" => cmd_holders(rest),
        "delegations" => cmd_delegations(rest),
        "transfer" | "approve" | "transfer-from" => cmd_mutate(rest, cmd.as_str()),
        _ => usage(),
    }
}
