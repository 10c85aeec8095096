//! answering side of the replication protocol
//!
//! a line-oriented request/response exchange over any byte pipe; the ssh
//! transport runs this over `ssh <host> ori serve --stdio <path>`.
//!
//! requests: `head`, `list-heads`, `has <hex>`, `type <hex>`, `get <hex>`,
//! `bye`. responses start with `ok` or `err`; `get` follows its `ok <len>`
//! line with exactly `len` raw payload bytes.

use std::io::{BufRead, Write};

use tracing::debug;

use crate::error::{IoResultExt, Result};
use crate::hash::Hash;
use crate::repo::Repo;

/// serve the read contract until EOF or `bye`
pub fn serve<R: BufRead, W: Write>(repo: &Repo, mut reader: R, mut writer: W) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).with_path("<serve>")?;
        if n == 0 {
            break;
        }
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        if request == "bye" {
            break;
        }

        debug!(%request, "serve request");
        match respond(repo, request, &mut writer) {
            Ok(()) => {}
            Err(e) => {
                // per-request failures go to the peer; the session survives
                writeln!(writer, "err {}", e).with_path("<serve>")?;
            }
        }
        writer.flush().with_path("<serve>")?;
    }
    Ok(())
}

fn respond<W: Write>(repo: &Repo, request: &str, writer: &mut W) -> Result<()> {
    let (cmd, arg) = match request.split_once(' ') {
        Some((c, a)) => (c, a),
        None => (request, ""),
    };

    match cmd {
        "head" => {
            let head = repo.head()?;
            writeln!(writer, "ok {}", head.to_hex()).with_path("<serve>")?;
        }
        "list-heads" => {
            let mut heads = Vec::new();
            let head = repo.head()?;
            if !head.is_empty() {
                heads.push(head);
            }
            heads.extend(repo.find_lost_heads()?);
            writeln!(writer, "ok {}", heads.len()).with_path("<serve>")?;
            for h in heads {
                writeln!(writer, "{}", h.to_hex()).with_path("<serve>")?;
            }
        }
        "has" => {
            let hash = Hash::from_hex(arg)?;
            let present = repo.store().contains(&hash);
            writeln!(writer, "ok {}", if present { 1 } else { 0 }).with_path("<serve>")?;
        }
        "type" => {
            let hash = Hash::from_hex(arg)?;
            let object_type = repo.store().type_of(&hash)?;
            writeln!(
                writer,
                "ok {}",
                std::str::from_utf8(object_type.tag()).expect("tags are ascii")
            )
            .with_path("<serve>")?;
        }
        "get" => {
            let hash = Hash::from_hex(arg)?;
            let payload = repo.store().get_bytes(&hash)?;
            writeln!(writer, "ok {}", payload.len()).with_path("<serve>")?;
            writer.write_all(&payload).with_path("<serve>")?;
        }
        _ => {
            writeln!(writer, "err unknown command: {}", cmd).with_path("<serve>")?;
        }
    }
    Ok(())
}
