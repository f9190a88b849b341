//! Report rendering.  Field and section order are fixed so two reports diff line by line;
//! floats carry six decimals and non-finite values render as `null`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::Context;
use log::{error, info};
use serde::Serialize;
use serde_json::ser::{CompactFormatter, Formatter, PrettyFormatter, Serializer};
use serde_json::{json, Map, Value};

use crate::stats::cycle::CycleStatsSummary;
use crate::stats::summary::SummaryStats;
use crate::stats::types::TableKey;

const RULE: &str =
    "================================================================================";

/// Fixed six-decimal floats on top of a wrapped layout formatter.  Non-finite floats never
/// reach it: they are already `null` in the value tree.
struct FixedPoint<F>(F);

impl<F: Formatter> Formatter for FixedPoint<F> {
    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        write!(writer, "{:.6}", value)
    }

    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.0.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.0.begin_object_key(writer, first)
    }

    fn end_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object_key(writer)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object_value(writer)
    }
}

fn heatmap(buckets: &BTreeMap<u64, u64>) -> Value {
    let map: Map<String, Value> = buckets
        .iter()
        .map(|(bucket, count)| (format!("0x{:x}", bucket), json!(count)))
        .collect();
    Value::Object(map)
}

fn memory_access(s: &SummaryStats) -> Value {
    let m = &s.memory_access;
    json!({
        "cache": {
            "hits": m.cache_hits,
            "misses": m.cache_misses,
            "hit_rate": m.cache_hit_rate(),
            "read_hits": m.cache_read_hits,
            "read_misses": m.cache_read_misses,
            "write_hits": m.cache_write_hits,
            "write_misses": m.cache_write_misses,
        },
        "spm": {
            "reads": m.spm_reads,
            "writes": m.spm_writes,
            "read_bytes": m.spm_read_bytes,
            "write_bytes": m.spm_write_bytes,
        },
        "dma": {
            "read_requests": m.dma_read_requests,
            "write_requests": m.dma_write_requests,
            "read_bytes": m.dma_read_bytes,
            "write_bytes": m.dma_write_bytes,
            "read_latency_total": m.dma_read_latency_total,
            "write_latency_total": m.dma_write_latency_total,
        },
        "latency": {
            "avg_read": m.read_latency.avg(),
            "avg_write": m.write_latency.avg(),
            "min_read": m.read_latency.min_or_zero(),
            "max_read": m.read_latency.max,
            "min_write": m.write_latency.min_or_zero(),
            "max_write": m.write_latency.max,
        },
        "bandwidth": {
            "total_bytes_read": m.total_bytes_read,
            "total_bytes_written": m.total_bytes_written,
            "peak_read_bytes_per_cycle": m.peak_read_bytes_per_cycle,
            "peak_write_bytes_per_cycle": m.peak_write_bytes_per_cycle,
        },
        "contention": {
            "read_port_stalls": m.read_port_stalls,
            "write_port_stalls": m.write_port_stalls,
            "queue_full_stalls": m.queue_full_stalls,
        },
        "address_heatmap": {
            "granularity": m.heatmap.granularity,
            "read": heatmap(&m.heatmap.reads),
            "write": heatmap(&m.heatmap.writes),
        },
    })
}

fn dataflow(s: &SummaryStats) -> Value {
    let d = &s.dataflow;
    json!({
        "critical_path": {
            "length_cycles": d.critical_path_length,
            "instructions": d.critical_path_instructions,
            "loads": d.critical_path_loads,
            "stores": d.critical_path_stores,
            "computes": d.critical_path_computes,
        },
        "parallelism": {
            "ilp": d.ilp(),
            "avg_parallelism": d.avg_parallelism(),
            "max_parallel_ops": d.max_parallel_ops,
            "total_instructions": d.total_instructions,
        },
        "dependencies": {
            "raw_true": d.true_dependencies,
            "war_anti": d.anti_dependencies,
            "waw_output": d.output_dependencies,
            "control": d.control_dependencies,
            "memory": d.memory_dependencies,
            "total_edges": d.total_dependency_edges,
        },
    })
}

fn fu_utilization(s: &SummaryStats) -> Value {
    let f = &s.fu_utilization;
    let by_type: Map<String, Value> = f
        .by_type
        .iter()
        .filter(|(_, util)| {
            util.instances_available > 0 || util.total_operations > 0 || util.contention_requests > 0
        })
        .map(|(fu, util)| {
            let entry = json!({
                "instances": util.instances_available,
                "max_concurrent": util.max_concurrent_used,
                "busy_cycles": util.total_busy_cycles,
                "operations": util.total_operations,
                "contention_stalls": util.contention_stalls,
                "contention_rate": util.contention_rate(),
            });
            (fu.name().to_string(), entry)
        })
        .collect();
    json!({
        "total_busy_cycles": f.total_busy_cycles,
        "total_contention_stalls": f.total_contention_stalls,
        "by_type": by_type,
        "most_contended": f.most_contended().map_or("none", |fu| fu.name()),
    })
}

fn stall_breakdown(s: &SummaryStats) -> Value {
    let b = &s.stall_breakdown;
    let by_cause: Map<String, Value> = b
        .cause_counts()
        .into_iter()
        .map(|(name, count)| (name.to_string(), json!(count)))
        .collect();
    json!({
        "by_cause": by_cause,
        "memory_detail": {
            "read_stalls": b.memory.read_stalls,
            "write_stalls": b.memory.write_stalls,
            "cache_miss_stalls": b.memory.cache_miss_stalls,
            "dma_stalls": b.memory.dma_stalls,
        },
        "dependency_detail": {
            "raw_stalls": b.dependency.raw_stalls,
            "waw_stalls": b.dependency.waw_stalls,
            "war_stalls": b.dependency.war_stalls,
        },
        "resource_detail": {
            "read_port_stalls": b.resource.read_port_stalls,
            "write_port_stalls": b.resource.write_port_stalls,
            "reservation_full": b.resource.reservation_full,
            "compute_queue_full": b.resource.compute_queue_full,
        },
        "total_stall_cycles": b.total_stall_cycles,
        "max_consecutive_stalls": b.max_consecutive_stalls,
        "stall_events": b.stall_events,
        "avg_stall_duration": b.avg_stall_duration(),
        "dominant_bottleneck": b.dominant_bottleneck(),
    })
}

/// The full report as a value tree.  Non-finite floats are already `null` here.
pub fn to_value(s: &SummaryStats) -> Value {
    let p = &s.performance;
    let static_count: Map<String, Value> = s
        .functional_units
        .static_count
        .iter()
        .map(|(fu, &count)| (fu.name().to_string(), json!(count)))
        .collect();
    let m = &s.memory;
    let pw = &s.power;
    let a = &s.area;

    json!({
        "salam_stats": {
            "version": s.version,
            "accelerator_name": s.accelerator_name,
            "timestamp": s.timestamp,
            "performance": {
                "setup_time_ns": p.setup_time_ns,
                "sim_time_ns": p.sim_time_ns,
                "clock_period_ns": p.clock_period_ns,
                "sys_clock_ghz": p.sys_clock_ghz,
                "total_cycles": p.total_cycles,
                "stall_cycles": p.stall_cycles,
                "executed_nodes": p.executed_nodes,
            },
            "functional_units": {
                "static_count": static_count,
            },
            "memory": {
                "cache_size_kb": m.cache_size_kb,
                "spm_size_kb": m.spm_size_kb,
                "mem_reads": m.mem_reads,
                "mem_writes": m.mem_writes,
                "dma_reads": m.dma_reads,
                "dma_writes": m.dma_writes,
            },
            "power": {
                "fu_total_mw": pw.fu_total,
                "reg_total_mw": pw.reg_total,
                "spm_total_mw": pw.spm_total,
                "cache_total_mw": pw.cache_total,
                "total_power_mw": pw.total_power,
                "total_energy_nj": pw.total_energy_nj,
            },
            "area": {
                "fu_area_um2": a.fu_area_um2,
                "reg_area_um2": a.reg_area_um2,
                "spm_area_um2": a.spm_area_um2,
                "cache_area_um2": a.cache_area_um2,
                "total_area_um2": a.total_area_um2,
                "total_area_mm2": a.total_area_mm2(),
            },
            "memory_access": memory_access(s),
            "dataflow": dataflow(s),
            "fu_utilization": fu_utilization(s),
            "stall_breakdown": stall_breakdown(s),
        }
    })
}

fn render<F: Formatter>(value: &Value, formatter: F) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    let mut ser = Serializer::with_formatter(&mut out, FixedPoint(formatter));
    value.serialize(&mut ser)?;
    Ok(out)
}

/// Renders the report.  `pretty` only adds two-space indentation and newlines.
pub fn to_json(s: &SummaryStats, pretty: bool) -> String {
    let value = to_value(s);
    let rendered = if pretty {
        render(&value, PrettyFormatter::with_indent(b"  ")).map(|mut out| {
            out.push(b'\n');
            out
        })
    } else {
        render(&value, CompactFormatter)
    };
    match rendered {
        Ok(out) => String::from_utf8_lossy(&out).into_owned(),
        Err(err) => {
            error!("cannot render statistics report: {}", err);
            String::new()
        }
    }
}

/// Condensed human-readable digest.
pub fn print_summary(s: &SummaryStats) -> String {
    let p = &s.performance;
    let mut out = String::new();
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "SALAM Statistics Summary: {}", s.accelerator_name);
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "Performance:");
    let _ = writeln!(out, "  Total Cycles:    {}", p.total_cycles);
    let _ = writeln!(
        out,
        "  Stall Cycles:    {} ({:.1}%)",
        p.stall_cycles,
        100.0 * p.stall_cycles as f64 / p.total_cycles.max(1) as f64
    );
    let _ = writeln!(out, "  Clock:           {} GHz", p.sys_clock_ghz);
    let _ = writeln!(out, "Bottleneck:        {}", s.stall_breakdown.dominant_bottleneck());
    let _ = writeln!(out, "Memory:");
    let _ = writeln!(
        out,
        "  Cache Hit Rate:  {:.1}%",
        100.0 * s.memory_access.cache_hit_rate()
    );
    let _ = writeln!(
        out,
        "  Avg Read Latency:{:.1} cycles",
        s.memory_access.read_latency.avg()
    );
    let _ = writeln!(out, "Parallelism:");
    let _ = writeln!(out, "  ILP:             {:.2}", s.dataflow.ilp());
    let _ = writeln!(
        out,
        "  Critical Path:   {} cycles",
        s.dataflow.critical_path_length
    );
    let _ = writeln!(out, "Power/Area:");
    let _ = writeln!(out, "  Total Power:     {:.3} mW", s.power.total_power);
    let _ = writeln!(out, "  Total Area:      {:.3} mm\u{b2}", s.area.total_area_mm2());
    let _ = writeln!(out, "{}", RULE);
    out
}

/// `metric,value` rows of the headline numbers.
pub fn to_csv(s: &SummaryStats, cycles: &CycleStatsSummary) -> String {
    let p = &s.performance;
    let rows: Vec<(&str, String)> = vec![
        ("accelerator_name", s.accelerator_name.clone()),
        ("total_cycles", p.total_cycles.to_string()),
        ("stall_cycles", p.stall_cycles.to_string()),
        ("executed_nodes", p.executed_nodes.to_string()),
        ("clock_period_ns", p.clock_period_ns.to_string()),
        ("dominant_bottleneck", s.stall_breakdown.dominant_bottleneck().to_string()),
        ("max_consecutive_stalls", s.stall_breakdown.max_consecutive_stalls.to_string()),
        ("cache_hit_rate", format!("{:.6}", s.memory_access.cache_hit_rate())),
        ("avg_read_latency", format!("{:.6}", s.memory_access.read_latency.avg())),
        ("avg_write_latency", format!("{:.6}", s.memory_access.write_latency.avg())),
        ("total_bytes_read", s.memory_access.total_bytes_read.to_string()),
        ("total_bytes_written", s.memory_access.total_bytes_written.to_string()),
        ("critical_path_length", s.dataflow.critical_path_length.to_string()),
        ("ilp", format!("{:.6}", s.dataflow.ilp())),
        ("avg_parallelism", format!("{:.6}", s.dataflow.avg_parallelism())),
        ("register_reads", s.registers.reads.to_string()),
        ("register_writes", s.registers.writes.to_string()),
        ("total_power_mw", format!("{:.6}", s.power.total_power)),
        ("total_energy_nj", format!("{:.6}", s.power.total_energy_nj)),
        ("total_area_mm2", format!("{:.6}", s.area.total_area_mm2())),
        ("cycle_samples", cycles.total_samples.to_string()),
        ("avg_load_in_flight", format!("{:.6}", cycles.avg_load_in_flight)),
        ("avg_comp_in_flight", format!("{:.6}", cycles.avg_comp_in_flight)),
        ("peak_res_in_flight", cycles.peak_res_in_flight.to_string()),
    ];

    let mut out = String::from("metric,value\n");
    for (metric, value) in rows {
        let _ = writeln!(out, "{},{}", metric, value);
    }
    out
}

/// Writes `contents` to `path`.  An empty path means reporting is off.
pub fn write_report(path: &Path, contents: &str) -> Result<(), anyhow::Error> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    match fs::write(path, contents).with_context(|| format!("cannot write {}", path.display())) {
        Ok(()) => {
            info!("statistics written to {}", path.display());
            Ok(())
        }
        Err(err) => {
            error!("{:#}", err);
            Err(err)
        }
    }
}
