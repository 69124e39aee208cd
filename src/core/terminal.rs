use console::{Emoji, style};

pub static LOOKING_GLASS: Emoji<'_, '_> = Emoji("🔍 ", "");
pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static MICROSCOPE: Emoji<'_, '_> = Emoji("🔬 ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_step(step: &str) {
    println!("{} {}", ROCKET, style(step).bold());
}

pub fn print_finding(msg: &str) {
    println!("  {} {}", LOOKING_GLASS, msg);
}

pub fn print_header(title: &str) {
    println!("\n{} {}", MICROSCOPE, style(title).bold().magenta());
}

/// One `command   description` line of the help screen.
pub fn print_command(command: &str, description: &str) {
    println!("  {:<44} {}", style(command).green(), style(description).dim());
}
