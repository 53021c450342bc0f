pub mod background;
pub mod run;

/// Short error banner shared by every command.
pub fn render_error(message: &str) {
    eprintln!("{} {}", console::style("Error:").red().bold(), message);
}
