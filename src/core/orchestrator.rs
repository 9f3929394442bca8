// BtCrab - GPL-3.0-or-later
// This file is part of BtCrab.
//
// Copyright (C) 2025 Daniel Freiermuth
//
// BtCrab is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// BtCrab is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with BtCrab.  If not, see <https://www.gnu.org/licenses/>.

//! Decode orchestrator.
//!
//! Every capture of a load gets its own blocking decode task. A task streams
//! decoded packets back in chunks on one channel and side events (keys,
//! connection events, the discovered local address) on another. Once every
//! task has reported, the per-file connection tables are merged, provisional
//! endpoints are backfilled and the result is published as one immutable
//! [`DecodeSnapshot`].

use crate::ccc::CccMessage;
use crate::config::DecoderConfig;
use crate::core::generation::{GenerationCounter, GenerationToken};
use crate::core::tracker::{Backfill, ConnectionTable};
use crate::error::{DecodeError, Result};
use crate::parser::btsnoop::BtsnoopReader;
use crate::parser::hci::{CccChannels, DecodeContext};
use crate::parser::logcat::{scan_text_log, TextLogScan};
use crate::parser::packet::{
    BdAddr, CaptureFile, ConnectionEvent, ConnectionRecord, DecodedPacket, FileId, PacketClass,
    SecurityKeyRecord, SideEvent,
};
use arc_swap::ArcSwapOption;
use rayon::prelude::*;
use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;

/// A capture buffer and the name it is reported under
#[derive(Debug, Clone)]
pub struct CaptureInput {
    pub name: String,
    pub data: Vec<u8>,
}

/// A text log scanned for CCC markers and the local address
#[derive(Debug, Clone)]
pub struct TextLogInput {
    pub name: String,
    pub content: String,
}

/// Everything one load works on
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub captures: Vec<CaptureInput>,
    pub text_logs: Vec<TextLogInput>,
    /// Local address known before decoding starts
    pub local_identity: Option<BdAddr>,
}

impl LoadRequest {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capture(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.captures.push(CaptureInput {
            name: name.into(),
            data,
        });
        self
    }

    #[must_use]
    pub fn with_text_log(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.text_logs.push(TextLogInput {
            name: name.into(),
            content: content.into(),
        });
        self
    }

    #[must_use]
    pub const fn with_local_identity(mut self, address: Option<BdAddr>) -> Self {
        self.local_identity = address;
        self
    }
}

/// Final report of a decode task
#[derive(Debug)]
pub struct TaskSummary {
    pub file: FileId,
    /// Connections still open when the capture ended
    pub connections: Vec<ConnectionRecord>,
    /// Address from a Read BD_ADDR completion inside the capture
    pub local_identity: Option<BdAddr>,
    pub records: usize,
    pub truncated: bool,
}

/// Ordered stream of one decode task. Chunks of a file arrive in record order
/// and always before that file's `Complete`.
#[derive(Debug)]
pub enum TaskMessage {
    Chunk {
        file: FileId,
        packets: Vec<DecodedPacket>,
    },
    Complete(TaskSummary),
    Failed {
        file: FileId,
        error: DecodeError,
    },
}

fn serialize_errors<S: Serializer>(
    errors: &[DecodeError],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

/// Published result of one load
#[derive(Debug, Default, Serialize)]
pub struct DecodeSnapshot {
    pub generation: u64,
    /// Every capture of the request, decoded or not
    pub files: Vec<CaptureFile>,
    /// Grouped by file in request order, record order within a file. Each
    /// group opens with a `Meta` row.
    pub packets: Vec<DecodedPacket>,
    pub connections: ConnectionTable,
    /// Unfiltered; the same key may appear more than once
    pub keys: Vec<SecurityKeyRecord>,
    pub connection_events: Vec<ConnectionEvent>,
    /// Messages found in captures followed by those found in text logs
    pub ccc_messages: Vec<CccMessage>,
    pub local_identity: Option<BdAddr>,
    #[serde(serialize_with = "serialize_errors")]
    pub file_errors: Vec<DecodeError>,
}

impl DecodeSnapshot {
    /// Decoded records, without the per-file meta rows
    pub fn records(&self) -> impl Iterator<Item = &DecodedPacket> {
        self.packets.iter().filter(|p| p.class != PacketClass::Meta)
    }

    pub fn packets_for(&self, file: FileId) -> impl Iterator<Item = &DecodedPacket> {
        self.records().filter(move |p| p.frame.file == file)
    }

    /// Keys with repeated values removed, first sighting kept
    pub fn unique_keys(&self) -> Vec<&SecurityKeyRecord> {
        let mut seen = HashSet::new();
        self.keys
            .iter()
            .filter(|key| seen.insert(key.key_value.as_str()))
            .collect()
    }

    /// True when nothing at all could be decoded
    pub fn is_empty(&self) -> bool {
        self.records().next().is_none() && self.ccc_messages.is_empty()
    }
}

/// Owns the generation counter and the latest published snapshot
#[derive(Debug)]
pub struct Orchestrator {
    config: DecoderConfig,
    generations: GenerationCounter,
    snapshot: ArcSwapOption<DecodeSnapshot>,
    identity: watch::Sender<Option<BdAddr>>,
}

impl Orchestrator {
    pub fn new(config: DecoderConfig) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            config: config.sanitized(),
            generations: GenerationCounter::new(),
            snapshot: ArcSwapOption::empty(),
            identity,
        }
    }

    pub const fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Cancellation handle shared with whoever supersedes loads
    pub const fn generations(&self) -> &GenerationCounter {
        &self.generations
    }

    /// Drop every in-flight load
    pub fn cancel(&self) {
        let token = self.generations.advance();
        tracing::debug!("Cancelled loads older than generation {}", token.generation());
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Option<Arc<DecodeSnapshot>> {
        self.snapshot.load_full()
    }

    /// Local address as soon as any capture or log discloses it
    pub fn subscribe_identity(&self) -> watch::Receiver<Option<BdAddr>> {
        self.identity.subscribe()
    }

    /// Start a new generation and decode `request` under it.
    ///
    /// Returns `Ok(None)` when a newer load or a cancel superseded this one.
    pub async fn load(&self, request: LoadRequest) -> Result<Option<Arc<DecodeSnapshot>>> {
        let token = self.generations.advance();
        self.load_with_token(request, token).await
    }

    /// Decode `request` under an existing generation token
    pub async fn load_with_token(
        &self,
        request: LoadRequest,
        token: GenerationToken,
    ) -> Result<Option<Arc<DecodeSnapshot>>> {
        profiling::scope!("Orchestrator::load");
        let start = Instant::now();
        let LoadRequest {
            captures,
            text_logs,
            local_identity,
        } = request;

        let scans = scan_text_logs(text_logs).await?;
        if !token.is_current() {
            tracing::debug!("Generation {} superseded during text log scan", token.generation());
            return Ok(None);
        }

        let hint = local_identity
            .or_else(|| scans.iter().rev().find_map(|scan| scan.local_identity))
            .or(self.config.local_address);
        if hint.is_some() {
            self.identity.send_replace(hint);
        }
        tracing::info!(
            "Loading {} captures and {} text logs (generation {}, local identity {})",
            captures.len(),
            scans.len(),
            token.generation(),
            hint.map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );

        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut collector = Collector::default();
        let mut handles = Vec::with_capacity(captures.len());

        for (idx, capture) in captures.into_iter().enumerate() {
            let file = CaptureFile {
                id: FileId(idx),
                name: capture.name,
            };
            let job = DecodeJob {
                file: file.clone(),
                data: capture.data,
                hint,
                channels: self.config.ccc_channels(),
                chunk_size: self.config.chunk_size,
                token: token.clone(),
                packets: packet_tx.clone(),
                events: event_tx.clone(),
            };
            handles.push((file.id, tokio::task::spawn_blocking(move || job.run())));
            collector.files.push(FileState::new(file));
        }
        drop(packet_tx);
        drop(event_tx);

        let mut packets_open = true;
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                event = event_rx.recv(), if events_open => match event {
                    Some(event) => {
                        if let Some(address) = collector.side_event(event) {
                            if token.is_current() {
                                self.identity.send_replace(Some(address));
                            }
                        }
                    }
                    None => events_open = false,
                },
                message = packet_rx.recv(), if packets_open => match message {
                    Some(message) => {
                        if collector.task_message(message) {
                            tokio::task::yield_now().await;
                        }
                    }
                    None => packets_open = false,
                },
                else => break,
            }
            if !token.is_current() {
                tracing::debug!("Generation {} superseded, dropping results", token.generation());
                return Ok(None);
            }
        }

        for (file, handle) in handles {
            if let Err(e) = handle.await {
                let name = collector.name(file);
                tracing::warn!("{name}: decode task died: {e}");
                collector.errors.push(DecodeError::TaskFailed {
                    name,
                    reason: e.to_string(),
                });
            }
        }

        let Some(snapshot) = collector
            .finish(token.generation(), hint, scans, &self.config, &token)
            .await
        else {
            tracing::debug!("Generation {} superseded during backfill", token.generation());
            return Ok(None);
        };

        if !token.is_current() {
            return Ok(None);
        }
        tracing::info!(
            "Generation {} done in {:?}: {} packets, {} connections, {} keys, {} CCC messages, {} file errors",
            snapshot.generation,
            start.elapsed(),
            snapshot.packets.len(),
            snapshot.connections.len(),
            snapshot.keys.len(),
            snapshot.ccc_messages.len(),
            snapshot.file_errors.len()
        );
        let snapshot = Arc::new(snapshot);
        self.snapshot.store(Some(Arc::clone(&snapshot)));
        Ok(Some(snapshot))
    }
}

/// Decode on a private current-thread runtime
pub fn decode_blocking(config: DecoderConfig, request: LoadRequest) -> Result<Arc<DecodeSnapshot>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let orchestrator = Orchestrator::new(config);
    runtime
        .block_on(orchestrator.load(request))?
        .ok_or(DecodeError::Superseded)
}

async fn scan_text_logs(logs: Vec<TextLogInput>) -> Result<Vec<TextLogScan>> {
    if logs.is_empty() {
        return Ok(Vec::new());
    }
    tokio::task::spawn_blocking(move || {
        logs.par_iter()
            .map(|log| scan_text_log(&log.name, &log.content))
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| DecodeError::TaskFailed {
        name: "text logs".to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Decode task
// ============================================================================

struct DecodeJob {
    file: CaptureFile,
    data: Vec<u8>,
    hint: Option<BdAddr>,
    channels: CccChannels,
    chunk_size: usize,
    token: GenerationToken,
    packets: UnboundedSender<TaskMessage>,
    events: UnboundedSender<SideEvent>,
}

impl DecodeJob {
    fn run(self) {
        profiling::scope!("DecodeJob::run");
        let Self {
            file,
            data,
            hint,
            channels,
            chunk_size,
            token,
            packets,
            events,
        } = self;
        let start = Instant::now();
        tracing::info!("{}: decoding {} bytes", file.name, data.len());

        let mut reader = match BtsnoopReader::new(file.id, &file.name, &data) {
            Ok(reader) => reader,
            Err(error) => {
                tracing::warn!("{error}");
                let _ = packets.send(TaskMessage::Failed {
                    file: file.id,
                    error,
                });
                return;
            }
        };

        let chunk_size = chunk_size.max(1);
        let mut ctx = DecodeContext::new(file.id, hint, channels);
        let mut chunk = Vec::with_capacity(chunk_size);
        let mut records = 0usize;

        for frame in reader.by_ref() {
            records += 1;
            let packet = ctx.interpret(frame);
            tracing::trace!("{}: {}", file.name, packet.format_line());
            chunk.push(packet);

            for event in ctx.drain_events() {
                tracing::debug!("{}: side event {event:?}", file.name);
                if events.send(event).is_err() {
                    return;
                }
            }

            if chunk.len() >= chunk_size {
                if !token.is_current() {
                    tracing::debug!("{}: generation superseded, stopping", file.name);
                    return;
                }
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                tracing::debug!("{}: flushing {} packets", file.name, full.len());
                if packets
                    .send(TaskMessage::Chunk {
                        file: file.id,
                        packets: full,
                    })
                    .is_err()
                {
                    return;
                }
            }
        }

        if !chunk.is_empty() {
            tracing::debug!("{}: flushing {} packets", file.name, chunk.len());
            let _ = packets.send(TaskMessage::Chunk {
                file: file.id,
                packets: chunk,
            });
        }

        let truncated = reader.is_truncated();
        if truncated {
            tracing::warn!(
                "{}: capture ends inside a record at offset {}, kept {records} records",
                file.name,
                reader.offset()
            );
        }
        if records == 0 {
            let error = DecodeError::EmptyCapture { name: file.name };
            tracing::warn!("{error}");
            let _ = packets.send(TaskMessage::Failed {
                file: file.id,
                error,
            });
            return;
        }

        let elapsed = start.elapsed();
        tracing::info!(
            "{}: decoded {records} records in {elapsed:?} ({:.0} records/s), {} connections open at end",
            file.name,
            records as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
            ctx.tracker().len()
        );
        let local_identity = ctx.discovered_identity();
        let _ = packets.send(TaskMessage::Complete(TaskSummary {
            file: file.id,
            connections: ctx.into_tracker().into_records(),
            local_identity,
            records,
            truncated,
        }));
    }
}

// ============================================================================
// Coordinator state
// ============================================================================

#[derive(Debug)]
struct FileState {
    file: CaptureFile,
    packets: Vec<DecodedPacket>,
    summary: Option<TaskSummary>,
}

impl FileState {
    const fn new(file: CaptureFile) -> Self {
        Self {
            file,
            packets: Vec::new(),
            summary: None,
        }
    }
}

/// Single writer of everything the tasks report
#[derive(Debug, Default)]
struct Collector {
    files: Vec<FileState>,
    keys: Vec<SecurityKeyRecord>,
    connection_events: Vec<ConnectionEvent>,
    identities: HashMap<FileId, BdAddr>,
    errors: Vec<DecodeError>,
}

impl Collector {
    fn name(&self, file: FileId) -> String {
        self.files
            .get(file.0)
            .map_or_else(|| format!("file {}", file.0), |state| state.file.name.clone())
    }

    /// Record a side event; returns a newly discovered local address
    fn side_event(&mut self, event: SideEvent) -> Option<BdAddr> {
        match event {
            SideEvent::Key(key) => {
                self.keys.push(key);
                None
            }
            SideEvent::Connection(event) => {
                self.connection_events.push(event);
                None
            }
            SideEvent::LocalIdentity { file, address } => {
                tracing::info!("{}: local identity is {address}", self.name(file));
                self.identities.insert(file, address);
                Some(address)
            }
        }
    }

    /// Record a task message; returns true for packet chunks
    fn task_message(&mut self, message: TaskMessage) -> bool {
        match message {
            TaskMessage::Chunk { file, packets } => {
                if let Some(state) = self.files.get_mut(file.0) {
                    state.packets.extend(packets);
                }
                true
            }
            TaskMessage::Complete(summary) => {
                if let Some(identity) = summary.local_identity {
                    self.identities.insert(summary.file, identity);
                }
                if let Some(state) = self.files.get_mut(summary.file.0) {
                    tracing::debug!(
                        "{}: complete, {} records, {} open connections{}",
                        state.file.name,
                        summary.records,
                        summary.connections.len(),
                        if summary.truncated { ", truncated" } else { "" }
                    );
                    state.summary = Some(summary);
                }
                false
            }
            TaskMessage::Failed { error, .. } => {
                self.errors.push(error);
                false
            }
        }
    }

    /// Merge, backfill and assemble the snapshot. `None` when superseded.
    async fn finish(
        self,
        generation: u64,
        hint: Option<BdAddr>,
        scans: Vec<TextLogScan>,
        config: &DecoderConfig,
        token: &GenerationToken,
    ) -> Option<DecodeSnapshot> {
        profiling::scope!("Collector::finish");
        let Self {
            files,
            mut keys,
            connection_events,
            identities,
            errors,
        } = self;

        let mut table = ConnectionTable::new();
        let mut packets = Vec::with_capacity(files.iter().map(|s| s.packets.len() + 1).sum());
        let mut captures = Vec::with_capacity(files.len());
        for state in files {
            if let Some(summary) = state.summary {
                table.merge(summary.connections);
                packets.push(DecodedPacket::meta(&state.file));
                packets.extend(state.packets);
            }
            captures.push(state.file);
        }

        let mut backfill = Backfill::new(&table).with_fallback_identity(hint);
        for (file, address) in &identities {
            backfill = backfill.with_file_identity(*file, *address);
        }

        let interval = config.backfill_yield_interval.max(1);
        let mut resolved = 0usize;
        for (idx, packet) in packets.iter_mut().enumerate() {
            if backfill.apply(packet) {
                resolved += 1;
            }
            if (idx + 1) % interval == 0 {
                tokio::task::yield_now().await;
                if !token.is_current() {
                    return None;
                }
            }
        }
        for key in &mut keys {
            key.owner = backfill.resolve(key.file, key.owner);
        }
        tracing::debug!("Backfill resolved endpoints of {resolved} packets");

        let local_identity = captures
            .iter()
            .find_map(|file| identities.get(&file.id).copied())
            .or(hint);

        let mut ccc_messages: Vec<CccMessage> =
            packets.iter().filter_map(|p| p.ccc.clone()).collect();
        ccc_messages.extend(scans.into_iter().flat_map(|scan| scan.ccc_messages));

        Some(DecodeSnapshot {
            generation,
            files: captures,
            packets,
            connections: table,
            keys,
            connection_events,
            ccc_messages,
            local_identity,
            file_errors: errors,
        })
    }
}
