use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use guestrpc_rpci::RpciReply;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    schema_id: &'a str,
    command: &'a str,
    ok: bool,
    body_size: usize,
    body: String,
}

pub fn print_reply(command: &str, reply: &RpciReply, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                schema_id: "guestrpc/cli/v1/rpci-reply",
                command,
                ok: reply.ok,
                body_size: reply.body.len(),
                body: payload_preview(&reply.body),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["COMMAND", "STATUS", "SIZE", "REPLY"])
                .add_row(vec![
                    command.to_string(),
                    status_text(reply.ok).to_string(),
                    reply.body.len().to_string(),
                    payload_preview(&reply.body),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "status={} size={} reply={}",
                status_text(reply.ok),
                reply.body.len(),
                payload_preview(&reply.body)
            );
        }
        OutputFormat::Raw => print_raw(&reply.body),
    }
}

#[derive(Serialize)]
pub struct GuestInfoOutput<'a> {
    pub schema_id: &'a str,
    pub key: &'a str,
    pub found: bool,
    pub value: Option<&'a str>,
}

pub fn print_guestinfo(out: &GuestInfoOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KEY", "FOUND", "VALUE"])
                .add_row(vec![
                    format!("guestinfo.{}", out.key),
                    out.found.to_string(),
                    out.value.unwrap_or("").to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match out.value {
            Some(value) => println!("guestinfo.{} = {value}", out.key),
            None => println!("guestinfo.{} is not set", out.key),
        },
        OutputFormat::Raw => {
            if let Some(value) = out.value {
                print_raw(value.as_bytes());
            }
        }
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn status_text(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "failed"
    }
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}
