//! Output formatting for the rollout CLI
//!
//! Human output is colored with `colored` unless `--no-color` or `NO_COLOR`
//! is set; JSON mode prints machine-readable documents on stdout.

use colored::Colorize;
use indexmap::IndexMap;
use std::time::Duration;

use rollout::executor::{OutcomeCounts, ReportEntry, RunReport, RunStatus, TaskStatus};
use rollout::inventory::Inventory;

/// Output formatter for different output modes
pub struct OutputFormatter {
    /// Use colored output
    use_color: bool,
    /// JSON output mode
    json_mode: bool,
    /// Verbosity level
    verbosity: u8,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, json_mode: bool, verbosity: u8) -> Self {
        // Respect NO_COLOR environment variable
        let use_color = use_color && std::env::var("NO_COLOR").is_err();

        Self {
            use_color,
            json_mode,
            verbosity,
        }
    }

    /// Print a banner/header
    pub fn banner(&self, title: &str) {
        if self.json_mode {
            return;
        }

        let line = "=".repeat(title.len() + 4);
        if self.use_color {
            println!("\n{}", line.bright_blue());
            println!("{}", format!("  {}  ", title).bright_blue().bold());
            println!("{}\n", line.bright_blue());
        } else {
            println!("\n{}", line);
            println!("  {}  ", title);
            println!("{}\n", line);
        }
    }

    /// Print a section header
    pub fn section(&self, title: &str) {
        if self.json_mode {
            return;
        }

        if self.use_color {
            println!("\n{}", title.cyan().bold());
            println!("{}", "-".repeat(title.len()).cyan());
        } else {
            println!("\n{}", title);
            println!("{}", "-".repeat(title.len()));
        }
    }

    /// Print one report entry
    pub fn task_result(&self, entry: &ReportEntry) {
        let status = status_label(entry);
        let status_str = if self.use_color {
            match entry.outcome.status {
                TaskStatus::Success => status.green().to_string(),
                TaskStatus::Skipped => status.cyan().to_string(),
                TaskStatus::Failure if entry.best_effort => status.yellow().to_string(),
                TaskStatus::Failure => status.red().bold().to_string(),
            }
        } else {
            status.to_string()
        };

        let host_str = if self.use_color {
            entry.host.bright_white().bold().to_string()
        } else {
            entry.host.clone()
        };

        print!("{}: [{}]", status_str, host_str);
        if entry.attempts > 1 {
            print!(" (attempts: {})", entry.attempts);
        }
        if let Some(msg) = &entry.outcome.error {
            print!(" => {}", msg);
        }
        println!();

        if self.verbosity >= 1 && !entry.outcome.output.is_empty() {
            for line in entry.outcome.output.lines() {
                if self.use_color {
                    println!("    {}", line.bright_black());
                } else {
                    println!("    {}", line);
                }
            }
        }
    }

    /// Print a finished run: per-step results, recap and first failure
    pub fn report(&self, report: &RunReport) {
        if self.json_mode {
            match serde_json::to_string_pretty(report) {
                Ok(json) => println!("{}", json),
                Err(e) => self.error(&format!("Failed to serialize report: {}", e)),
            }
            return;
        }

        let mut current_task: Option<(usize, &str)> = None;
        for entry in &report.entries {
            if current_task != Some((entry.step, entry.task.as_str())) {
                self.task_header(&entry.task);
                current_task = Some((entry.step, entry.task.as_str()));
            }
            self.task_result(entry);
        }

        self.recap(report);

        if report.status == RunStatus::Failed {
            if let Some(failure) = report.first_failure() {
                self.failure_detail(failure);
            }
        }
    }

    fn task_header(&self, task_name: &str) {
        let header = format!("TASK [{}]", task_name);
        let stars = "*".repeat(80_usize.saturating_sub(header.len()));

        if self.use_color {
            println!("\n{} {}", header.bright_white().bold(), stars.bright_black());
        } else {
            println!("\n{} {}", header, stars);
        }
    }

    /// Print the per-host recap
    pub fn recap(&self, report: &RunReport) {
        let header = "RUN RECAP";
        let stars = "*".repeat(80 - header.len());
        if self.use_color {
            println!("\n{} {}", header.bright_white().bold(), stars.bright_black());
        } else {
            println!("\n{} {}", header, stars);
        }

        let mut hosts: IndexMap<&str, OutcomeCounts> = IndexMap::new();
        for entry in &report.entries {
            let counts = hosts.entry(entry.host.as_str()).or_default();
            match entry.outcome.status {
                TaskStatus::Success => counts.success += 1,
                TaskStatus::Failure => counts.failure += 1,
                TaskStatus::Skipped => counts.skipped += 1,
            }
        }

        for (host, counts) in &hosts {
            if self.use_color {
                let host_colored = if counts.failure > 0 {
                    host.red().bold()
                } else {
                    host.green()
                };
                let fmt_stat = |label: &str, value: usize, color: colored::Color| -> String {
                    if value > 0 {
                        format!("{}={:<4}", label.color(color), value)
                    } else {
                        format!("{}={:<4}", label, value).dimmed().to_string()
                    }
                };
                println!(
                    "{:<30} : {} {} {}",
                    host_colored,
                    fmt_stat("ok", counts.success, colored::Color::Green),
                    fmt_stat("failed", counts.failure, colored::Color::Red),
                    fmt_stat("skipped", counts.skipped, colored::Color::Cyan),
                );
            } else {
                println!(
                    "{:<30} : ok={:<4} failed={:<4} skipped={:<4}",
                    host, counts.success, counts.failure, counts.skipped
                );
            }
        }

        let duration = format_duration(report.duration().to_std().unwrap_or_default());
        let summary = format!("Run '{}' {} in {}", report.plan, report.status, duration);
        let summary = if report.cancelled {
            format!("{} (cancelled)", summary)
        } else {
            summary
        };

        if !self.use_color {
            println!("\n{}", summary);
            return;
        }
        match report.status {
            RunStatus::Succeeded => println!("\n{}", summary.green().bold()),
            RunStatus::PartiallyFailed => println!("\n{}", summary.yellow().bold()),
            _ => println!("\n{}", summary.red().bold()),
        }
    }

    fn failure_detail(&self, entry: &ReportEntry) {
        let title = format!("First failure: task '{}' on '{}'", entry.task, entry.host);
        if self.use_color {
            eprintln!("\n{}", title.red().bold());
        } else {
            eprintln!("\n{}", title);
        }
        if let Some(error) = &entry.outcome.error {
            eprintln!("  error: {}", error);
        }
        if !entry.outcome.output.is_empty() {
            eprintln!("  output:");
            for line in entry.outcome.output.lines() {
                eprintln!("    {}", line);
            }
        }
    }

    /// Print the hosts of every role, or of one role
    pub fn hosts(&self, inventory: &Inventory, role: Option<&str>) -> rollout::Result<()> {
        let mut listing: IndexMap<String, Vec<serde_json::Value>> = IndexMap::new();
        let roles: Vec<String> = match role {
            Some(role) => vec![role.to_string()],
            None => inventory.roles().map(str::to_string).collect(),
        };
        for name in roles {
            let hosts = match inventory.resolve(&name) {
                Ok(hosts) => hosts,
                // Declared roles without hosts are skipped in the full listing
                Err(rollout::Error::UnknownRole(_)) if role.is_none() => continue,
                Err(e) => return Err(e),
            };
            let entries = hosts
                .iter()
                .map(|h| {
                    serde_json::json!({
                        "name": h.name,
                        "address": h.address,
                        "port": h.port,
                        "user": h.user,
                    })
                })
                .collect();
            listing.insert(name, entries);
        }

        if self.json_mode {
            println!("{}", serde_json::to_string_pretty(&listing)?);
            return Ok(());
        }

        for (role, hosts) in &listing {
            self.section(&format!("{} ({})", role, hosts.len()));
            for host in hosts {
                let line = format!(
                    "{}@{}:{}",
                    host["user"].as_str().unwrap_or_default(),
                    host["address"].as_str().unwrap_or_default(),
                    host["port"]
                );
                let name = host["name"].as_str().unwrap_or_default();
                if self.use_color {
                    println!("  {:<24} {}", name.bright_white(), line.bright_black());
                } else {
                    println!("  {:<24} {}", name, line);
                }
            }
        }
        Ok(())
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.json_mode {
            let err = serde_json::json!({
                "type": "error",
                "message": message
            });
            eprintln!("{}", err);
            return;
        }

        if self.use_color {
            eprintln!("{} {}", "ERROR:".red().bold(), message);
        } else {
            eprintln!("ERROR: {}", message);
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.json_mode {
            let warn = serde_json::json!({
                "type": "warning",
                "message": message
            });
            eprintln!("{}", warn);
            return;
        }

        if self.use_color {
            eprintln!("{} {}", "WARNING:".yellow().bold(), message);
        } else {
            eprintln!("WARNING: {}", message);
        }
    }

    /// Print an info message (respects verbosity)
    pub fn info(&self, message: &str) {
        if self.verbosity < 1 || self.json_mode {
            return;
        }

        if self.use_color {
            println!("{} {}", "INFO:".blue(), message);
        } else {
            println!("INFO: {}", message);
        }
    }
}

fn status_label(entry: &ReportEntry) -> &'static str {
    match entry.outcome.status {
        TaskStatus::Success => "ok",
        TaskStatus::Skipped => "skipping",
        TaskStatus::Failure if entry.best_effort => "failed (ignored)",
        TaskStatus::Failure => "failed",
    }
}

/// Format a duration for display
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 3600 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;
        format!("{}h {}m {}s", hours, mins, secs)
    } else if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else if secs > 0 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}ms", millis)
    }
}
