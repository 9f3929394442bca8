/// `BtCrab` - A Bluetooth HCI trace decoder
///
/// Copyright (C) 2025 Daniel Freiermuth
///
/// This program is free software: you can redistribute it and/or modify
/// it under the terms of the GNU General Public License as published by
/// the Free Software Foundation, either version 3 of the License, or
/// (at your option) any later version.
///
/// This program is distributed in the hope that it will be useful,
/// but WITHOUT ANY WARRANTY; without even the implied warranty of
/// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
/// GNU General Public License for more details.
///
/// You should have received a copy of the GNU General Public License
/// along with this program.  If not, see <https://www.gnu.org/licenses/>.
use anyhow::{bail, Context};
use btcrab::parser::packet::BdAddr;
use btcrab::parser::{detect_input, InputKind};
use btcrab::{decode_blocking, DecodeSnapshot, DecoderConfig, LoadRequest};
use clap::{Parser, ValueEnum};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "ram-profiling")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Section {
    Packets,
    Connections,
    Keys,
    Ccc,
    All,
}

impl Section {
    fn includes(self, other: Self) -> bool {
        self == Self::All || self == other
    }
}

fn parse_handle(text: &str) -> Result<u16, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid ATT handle {text}: {e}"))
}

#[derive(Parser, Debug)]
#[command(name = "btcrab")]
#[command(author = "BtCrab Team")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
#[command(about = "Decode Bluetooth HCI captures, connections, keys and CCC Digital Key traffic", long_about = None)]
struct Args {
    /// BTSnoop capture files, decoded in the given order
    #[arg(value_name = "CAPTURE")]
    captures: Vec<PathBuf>,

    /// Text logs scanned for CCC messages and the local address
    #[arg(long = "log", value_name = "FILE")]
    logs: Vec<PathBuf>,

    /// Address of the capturing device, used when the capture never reports it
    #[arg(long, value_name = "XX:XX:XX:XX:XX:XX")]
    local_address: Option<BdAddr>,

    /// Decoded packets per streamed chunk
    #[arg(long, value_name = "N")]
    chunk_size: Option<usize>,

    /// Iterations between yields while backfilling
    #[arg(long, value_name = "N")]
    yield_interval: Option<usize>,

    /// ATT handle carrying CCC Digital Key messages (repeatable)
    #[arg(long = "ccc-att-handle", value_name = "HANDLE", value_parser = parse_handle)]
    ccc_att_handles: Vec<u16>,

    /// Do not look for CCC messages on LE credit based channels
    #[arg(long)]
    no_ccc_dynamic: bool,

    /// Store the effective settings as the new defaults
    #[arg(long)]
    save_config: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[arg(long, value_enum, default_value_t = Section::All)]
    show: Section,

    /// Path for the DHAT heap profiling output (only used when built with --features ram-profiling)
    #[cfg(feature = "ram-profiling")]
    #[arg(
        long = "profile-output",
        value_name = "PROFILE_FILE",
        default_value = "dhat-heap.json"
    )]
    profile_output: PathBuf,
}

impl Args {
    fn apply(&self, config: &mut DecoderConfig) {
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(interval) = self.yield_interval {
            config.backfill_yield_interval = interval;
        }
        if !self.ccc_att_handles.is_empty() {
            config.ccc_att_handles.clone_from(&self.ccc_att_handles);
        }
        if self.no_ccc_dynamic {
            config.ccc_dynamic_channels = false;
        }
        if self.local_address.is_some() {
            config.local_address = self.local_address;
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn build_request(args: &Args) -> LoadRequest {
    let mut request = LoadRequest::new();
    for path in &args.captures {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Cannot read {}: {e}", path.display());
                continue;
            }
        };
        request = match detect_input(&data) {
            InputKind::Btsnoop => request.with_capture(display_name(path), data),
            InputKind::TextLog => {
                tracing::info!("{} has no BTSnoop header, scanning it as a text log", path.display());
                request.with_text_log(display_name(path), String::from_utf8_lossy(&data))
            }
        };
    }
    for path in &args.logs {
        match std::fs::read(path) {
            Ok(data) => {
                request = request.with_text_log(display_name(path), String::from_utf8_lossy(&data));
            }
            Err(e) => tracing::error!("Cannot read {}: {e}", path.display()),
        }
    }
    request
}

fn print_text(out: &mut impl Write, snapshot: &DecodeSnapshot, show: Section) -> anyhow::Result<()> {
    if show.includes(Section::Packets) {
        for packet in &snapshot.packets {
            writeln!(out, "{}", packet.format_line())?;
        }
    }

    if show.includes(Section::Connections) {
        writeln!(out, "\nConnections:")?;
        for record in snapshot.connections.iter() {
            let file = snapshot
                .files
                .get(record.file.0)
                .map_or("?", |f| f.name.as_str());
            writeln!(
                out,
                "  {file}: handle 0x{:04x} -> {} (since #{})",
                record.handle, record.address, record.established_at
            )?;
        }
        writeln!(out, "\nConnection events:")?;
        for event in &snapshot.connection_events {
            let peer = event
                .address
                .map_or_else(|| "Unknown".to_string(), |a| a.to_string());
            writeln!(out, "  #{:<6} {peer} {}", event.sequence, event.parameters())?;
        }
    }

    if show.includes(Section::Keys) {
        writeln!(out, "\nKeys:")?;
        for key in snapshot.unique_keys() {
            writeln!(
                out,
                "  {} {} owner {} handle 0x{:04x} (#{})",
                key.key_type, key.key_value, key.owner, key.handle, key.sequence
            )?;
        }
    }

    if show.includes(Section::Ccc) {
        writeln!(out, "\nCCC messages:")?;
        for message in &snapshot.ccc_messages {
            writeln!(out, "  {}", message.describe())?;
        }
    }

    if let Some(identity) = snapshot.local_identity {
        writeln!(out, "\nLocal address: {identity}")?;
    }
    Ok(())
}

fn print_json(out: &mut impl Write, snapshot: &DecodeSnapshot, show: Section) -> anyhow::Result<()> {
    match show {
        Section::All => serde_json::to_writer_pretty(&mut *out, snapshot)?,
        Section::Packets => serde_json::to_writer_pretty(&mut *out, &snapshot.packets)?,
        Section::Connections => serde_json::to_writer_pretty(
            &mut *out,
            &serde_json::json!({
                "connections": &snapshot.connections,
                "events": &snapshot.connection_events,
            }),
        )?,
        Section::Keys => serde_json::to_writer_pretty(&mut *out, &snapshot.unique_keys())?,
        Section::Ccc => serde_json::to_writer_pretty(&mut *out, &snapshot.ccc_messages)?,
    }
    writeln!(out)?;
    Ok(())
}

fn main() -> anyhow::Result<ExitCode> {
    // Set RUST_LOG environment variable to override (e.g., RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    tracing::info!(
        "BtCrab starting up (version {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    #[cfg(feature = "ram-profiling")]
    let _profiler = {
        tracing::info!("RAM profiling enabled, output: {:?}", args.profile_output);
        dhat::Profiler::builder()
            .file_name(args.profile_output.clone())
            .build()
    };

    #[cfg(feature = "cpu-profiling")]
    {
        tracing::info!("CPU profiling enabled with Tracy - run Tracy profiler to connect");
    }

    let mut config = DecoderConfig::load();
    args.apply(&mut config);
    if args.save_config {
        config.save().context("Failed to save config")?;
    }

    let request = build_request(&args);
    if request.captures.is_empty() && request.text_logs.is_empty() {
        bail!("No readable input files given");
    }

    let snapshot = decode_blocking(config, request).context("Decoding failed")?;
    for error in &snapshot.file_errors {
        eprintln!("error: {error}");
    }

    let mut out = BufWriter::new(std::io::stdout().lock());
    match args.format {
        OutputFormat::Text => print_text(&mut out, &snapshot, args.show)?,
        OutputFormat::Json => print_json(&mut out, &snapshot, args.show)?,
    }
    out.flush()?;

    if snapshot.is_empty() {
        tracing::warn!("Nothing could be decoded");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
