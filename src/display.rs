use chrono::Local;
use colored::*;
use unicode_width::UnicodeWidthStr;

use crate::backup::BackupEntry;
use crate::i18n::I18n;
use crate::storage::{Chain, Command};
use crate::store_manager::Statistics;

const SUMMARY_WIDTH: usize = 60;

/// Pads to a display width, counting wide characters as two columns.
fn pad(text: &str, width: usize) -> String {
    let fill = width.saturating_sub(UnicodeWidthStr::width(text));
    format!("{}{}", text, " ".repeat(fill))
}

/// Cuts to at most `width` display columns, marking the cut with "...".
fn truncate(text: &str, width: usize) -> String {
    if UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = unicode_width::UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w + 3 > width {
            break;
        }
        out.push(c);
        used += w;
    }
    out.push_str("...");
    out
}

fn status_mark(exit_code: i32) -> ColoredString {
    if exit_code == 0 {
        "✓".green()
    } else {
        "✗".red()
    }
}

pub fn print_command(command: &Command) {
    let star = if command.is_favorite { "★".yellow() } else { " ".normal() };
    let mut line = format!(
        "{} {} {} {}",
        pad(&format!("#{}", command.id), 6).cyan(),
        status_mark(command.exit_code),
        star,
        pad(&truncate(&command.raw, SUMMARY_WIDTH), SUMMARY_WIDTH)
    );
    if !command.tags.is_empty() {
        line.push_str(&format!(" [{}]", command.tags.join(", ")).dimmed().to_string());
    }
    println!("{}", line);
}

pub fn print_commands(commands: &[&Command], i18n: &I18n) {
    if commands.is_empty() {
        println!("{}", i18n.t("no_commands").yellow());
        return;
    }
    for command in commands {
        print_command(command);
    }
}

pub fn print_command_details(command: &Command, i18n: &I18n) {
    println!("{} {}", format!("#{}", command.id).cyan().bold(), command.raw.bold());
    if !command.description.is_empty() {
        println!("  {}: {}", i18n.t("label_description"), command.description);
    }
    if !command.tags.is_empty() {
        println!("  {}: {}", i18n.t("label_tags"), command.tags.join(", "));
    }
    if let Some(dir) = &command.working_dir {
        println!("  {}: {}", i18n.t("label_directory"), dir.display());
    }
    println!(
        "  {}: {}  {}: {:.1}%  {}: {}",
        i18n.t("label_runs"),
        command.run_count,
        i18n.t("label_success_rate"),
        command.success_rate(),
        i18n.t("label_last_exit"),
        command.exit_code
    );
    println!(
        "  {}: {}",
        i18n.t("label_created"),
        command.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
}

pub fn print_tags(tags: &[(String, usize)], i18n: &I18n) {
    if tags.is_empty() {
        println!("{}", i18n.t("no_tags").yellow());
        return;
    }
    let width = tags.iter().map(|(t, _)| UnicodeWidthStr::width(t.as_str())).max().unwrap_or(0);
    println!("{}", i18n.t("tags_title").bold());
    for (tag, count) in tags {
        println!("  {}  {}", pad(tag, width).green(), count);
    }
}

pub fn print_statistics(stats: &Statistics, command_count: usize, i18n: &I18n) {
    println!("{}", i18n.t("stats_title").bold());
    println!("  {}: {}", i18n.t("stats_commands"), command_count);
    println!("  {}: {}", i18n.t("stats_total_runs"), stats.total_runs);
    println!("  {}: {:.1}%", i18n.t("label_success_rate"), stats.success_rate);
    println!("  {}: {}", i18n.t("stats_favorites"), stats.favorite_count);
    if !stats.most_used_tags.is_empty() {
        println!("  {}: {}", i18n.t("stats_top_tags"), stats.most_used_tags.join(", "));
    }
    if !stats.common_commands.is_empty() {
        println!("  {}:", i18n.t("stats_top_commands"));
        for (rank, command) in stats.common_commands.iter().enumerate() {
            println!("    {}. {}", rank + 1, truncate(command, SUMMARY_WIDTH));
        }
    }
}

pub fn print_chains(chains: &[Chain], i18n: &I18n) {
    if chains.is_empty() {
        println!("{}", i18n.t("no_chains").yellow());
        return;
    }
    for chain in chains {
        println!("{} {}", format!("#{}", chain.id).cyan().bold(), chain.name.bold());
        if !chain.description.is_empty() {
            println!("  {}", chain.description.dimmed());
        }
        let steps: Vec<String> = chain.steps.iter().map(|s| format!("#{}", s.command_id)).collect();
        println!("  {}: {}", i18n.t("label_steps"), steps.join(" -> "));
        for dependency in &chain.dependencies {
            let upstream: Vec<String> = dependency.depends_on.iter().map(|id| format!("#{}", id)).collect();
            println!(
                "  {}: {} ({})",
                i18n.t("label_depends_on"),
                upstream.join(", "),
                dependency.wait_policy
            );
        }
        let last_run = chain
            .last_run()
            .map(|ts| ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| i18n.t("never"));
        println!(
            "  {}: {}  {}: {:.1}%  {}: {}",
            i18n.t("label_runs"),
            chain.run_count,
            i18n.t("label_success_rate"),
            chain.success_rate,
            i18n.t("label_last_run"),
            last_run
        );
    }
}

pub fn print_backups(backups: &[BackupEntry], i18n: &I18n) {
    if backups.is_empty() {
        println!("{}", i18n.t("no_backups").yellow());
        return;
    }
    for backup in backups {
        println!(
            "{}  {}  {}",
            backup.modified.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            pad(&format!("{} B", backup.size), 10),
            backup.path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_counts_wide_characters() {
        assert_eq!(pad("ab", 4), "ab  ");
        assert_eq!(pad("部署", 6), "部署  ");
        assert_eq!(pad("toolong", 3), "toolong");
    }

    #[test]
    fn truncate_respects_display_width() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        assert_eq!(truncate("部署部署部署", 7), "部署...");
    }
}
