//! JSON trace document assembly.
//!
//! A dump walks the process registry, refreshes every thread's in-flight
//! edges, and serializes one self-contained document: capture metadata,
//! process-level figures, then each thread's call graph as a node table
//! plus edge records. Node ids are assigned in graph iteration order, so
//! two dumps of the same graph shape number their nodes identically.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::context::{ProcessContext, ThreadContext};
use crate::counter::{Counter, Metric};
use crate::error::{Error, Result};
use crate::info::now_unix_ms;
use crate::location::ScopeNode;

pub const SCHEMA_VERSION: &str = "1.0-scopetrace";

#[derive(Debug, Serialize)]
pub struct TraceDocument {
    pub metadata: Metadata,
    pub process: ProcessRecord,
    pub threads: Vec<ThreadRecord>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub schema_version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: i64,
    pub start_timestamp: i64,
    pub physical_memory: i64,
    pub memory_usage: MemoryUsage,
    pub cpu_usage: CpuUsage,
    pub thread_count: i64,
}

#[derive(Debug, Serialize)]
pub struct MemoryUsage {
    pub resident: i64,
    pub virtual_size: i64,
}

#[derive(Debug, Serialize)]
pub struct CpuUsage {
    /// Microseconds.
    pub user: u64,
    /// Microseconds.
    pub system: u64,
}

#[derive(Debug, Serialize)]
pub struct ThreadRecord {
    pub id: u64,
    pub name: String,
    pub start_timestamp: u64,
    /// Zero while the thread is still running.
    pub end_timestamp: u64,
    pub cpu_usage: CpuUsage,
    pub graph: GraphRecord,
}

#[derive(Debug, Serialize)]
pub struct GraphRecord {
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

#[derive(Debug, Serialize)]
pub struct NodeRecord {
    pub id: usize,
    pub tag: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Serialize)]
pub struct EdgeRecord {
    pub from: usize,
    pub to: usize,
    pub completed: bool,
    pub metrics: EdgeMetrics,
}

#[derive(Debug, Serialize)]
pub struct EdgeMetrics {
    /// Microseconds.
    pub cpu_user: u64,
    /// Microseconds.
    pub cpu_sys: u64,
    /// Microseconds.
    pub wall_clock: u64,
    /// Bytes.
    pub heap_alloc: u64,
    /// Bytes.
    pub heap_dealloc: u64,
}

impl EdgeMetrics {
    fn from_counter(counter: &Counter) -> Self {
        Self {
            cpu_user: counter.value(Metric::CpuUser),
            cpu_sys: counter.value(Metric::CpuSys),
            wall_clock: counter.value(Metric::WallClock),
            heap_alloc: counter.value(Metric::HeapAlloc),
            heap_dealloc: counter.value(Metric::HeapDealloc),
        }
    }
}

fn node_record(id: usize, node: &ScopeNode) -> NodeRecord {
    NodeRecord {
        id,
        tag: node.tag,
        file: node.location.file,
        line: node.location.line,
        column: node.location.column,
    }
}

fn thread_record(context: &ThreadContext) -> ThreadRecord {
    context.update_in_flight();
    let graph = context.graph();

    let mut nodes = Vec::new();
    let mut ids: HashMap<ScopeNode, usize> = HashMap::new();
    let mut id_of = |node: ScopeNode, nodes: &mut Vec<NodeRecord>| -> usize {
        let next = ids.len();
        *ids.entry(node).or_insert_with(|| {
            nodes.push(node_record(next, &node));
            next
        })
    };

    let mut edges = Vec::new();
    for (parent, children) in &graph {
        let from = id_of(*parent, &mut nodes);
        for (child, edge) in children {
            let to = id_of(*child, &mut nodes);
            edges.push(EdgeRecord {
                from,
                to,
                completed: edge.is_completed(),
                metrics: EdgeMetrics::from_counter(edge.total()),
            });
        }
    }

    let info = context.info();
    ThreadRecord {
        id: info.thread_id(),
        name: info.thread_name(),
        start_timestamp: info.start_timestamp(),
        end_timestamp: info.end_timestamp(),
        cpu_usage: CpuUsage {
            user: info.cpu_user_time(),
            system: info.cpu_system_time(),
        },
        graph: GraphRecord { nodes, edges },
    }
}

/// Assemble the full document from the installed registry.
pub fn build_document(context: &ProcessContext) -> TraceDocument {
    let process = context.process_info();
    let threads = context.threads();
    TraceDocument {
        metadata: Metadata {
            timestamp: now_unix_ms(),
            schema_version: SCHEMA_VERSION,
        },
        process: ProcessRecord {
            name: process.process_name(),
            pid: process.process_id(),
            start_timestamp: process.start_timestamp(),
            physical_memory: process.physical_memory(),
            memory_usage: MemoryUsage {
                resident: process.resident_size(),
                virtual_size: process.virtual_size(),
            },
            cpu_usage: CpuUsage {
                user: process.cpu_user_time().max(0) as u64,
                system: process.cpu_system_time().max(0) as u64,
            },
            thread_count: process.thread_count(),
        },
        threads: threads.iter().map(|t| thread_record(t)).collect(),
    }
}

/// Serialize the installed registry's document to pretty JSON.
pub fn dump_json() -> Result<String> {
    let context = ProcessContext::installed().ok_or(Error::NotInitialized)?;
    let document = build_document(context);
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Write the document to `writer`.
pub fn dump<W: Write>(writer: W) -> Result<()> {
    let context = ProcessContext::installed().ok_or(Error::NotInitialized)?;
    let document = build_document(context);
    serde_json::to_writer_pretty(writer, &document)?;
    Ok(())
}

/// Write the document to a file, creating or truncating it.
pub fn dump_to_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|source| Error::DumpWrite {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    dump(&mut writer)?;
    writer.flush().map_err(|source| Error::DumpWrite {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
