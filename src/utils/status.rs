/// Timestamped, leveled console output
///
/// Every orchestrator reports progress through these helpers so the
/// operator sees a uniform `timestamp LEVEL message` stream.

use colored::Colorize;

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn info(msg: &str) {
    println!("{} {} {}", timestamp().dimmed(), "INFO ".blue(), msg);
}

pub fn success(msg: &str) {
    println!("{} {} {}", timestamp().dimmed(), "OK   ".green(), msg);
}

pub fn warn(msg: &str) {
    println!("{} {} {}", timestamp().dimmed(), "WARN ".yellow(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {} {}", timestamp().dimmed(), "ERROR".red().bold(), msg);
}
