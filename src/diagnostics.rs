use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::job::JobId;

/// Timing of one job, as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub job: JobId,
    /// Calculation node the job was sent to.
    pub node: String,
    /// When the job was handed to the node.
    pub start: Instant,
    /// Round trip, including queueing in the pool.
    pub duration: Duration,
    /// Time the node reported spending on the job.
    pub reported: Duration,
    pub items: usize,
    pub failed_items: usize,
    pub timed_out: bool,
}

/// Timings of one processing cycle.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub compile_time: Duration,
    pub dispatch_time: Duration,
    pub executions: Vec<JobExecution>,
}

impl Diagnostics {
    pub fn job_count(&self) -> usize {
        self.executions.len()
    }

    pub fn failed_items(&self) -> usize {
        self.executions.iter().map(|exec| exec.failed_items).sum()
    }

    /// Sum of node-reported job time. Exceeds the wall clock when jobs ran in parallel.
    pub fn busy_time(&self) -> Duration {
        self.executions.iter().map(|exec| exec.reported).sum()
    }

    /// Renders a plain text waterfall of the jobs, one row per job, ordered
    /// by start time.
    pub fn render_timeline(&self) -> String {
        let mut jobs: Vec<&JobExecution> = self.executions.iter().collect();
        if jobs.is_empty() {
            return String::from("No jobs ran\n");
        }
        jobs.sort_by_key(|exec| exec.start);

        let Some(stats) = TimelineStats::from_jobs(&jobs) else {
            return String::from("No jobs ran\n");
        };

        let label_width = jobs
            .iter()
            .map(|exec| label(exec).len())
            .max()
            .unwrap_or_default();

        let mut buf = String::with_capacity(jobs.len() * (label_width + CHART_WIDTH + 16));
        for exec in jobs {
            let offset = exec.start.duration_since(stats.global_start).as_micros() as f64;
            let length = exec.duration.as_micros() as f64;

            let from = (offset / stats.total_micros * CHART_WIDTH as f64) as usize;
            let width = ((length / stats.total_micros * CHART_WIDTH as f64) as usize).max(1);
            let from = from.min(CHART_WIDTH - 1);
            let width = width.min(CHART_WIDTH - from);

            let mark = if exec.timed_out {
                '!'
            } else if exec.failed_items > 0 {
                'x'
            } else {
                '#'
            };

            let _ = writeln!(
                buf,
                "{:<label_width$} |{}{}{}| {}",
                label(exec),
                " ".repeat(from),
                mark.to_string().repeat(width),
                " ".repeat(CHART_WIDTH - from - width),
                TimelineStats::format_duration(length),
            );
        }

        buf
    }
}

const CHART_WIDTH: usize = 60;

fn label(exec: &JobExecution) -> String {
    format!("{} @ {} ({})", exec.job, exec.node, exec.items)
}

struct TimelineStats {
    global_start: Instant,
    total_micros: f64,
}

impl TimelineStats {
    fn from_jobs(jobs: &[&JobExecution]) -> Option<Self> {
        let global_start = jobs.first()?.start;
        let global_end = jobs.iter().map(|exec| exec.start + exec.duration).max()?;

        let total_micros = global_end.duration_since(global_start).as_micros().max(1) as f64;

        Some(Self {
            global_start,
            total_micros,
        })
    }

    fn format_duration(micros: f64) -> String {
        if micros < 1000.0 {
            format!("{:.0}µs", micros)
        } else {
            format!("{:.2}ms", micros / 1000.0)
        }
    }
}
