use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
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

pub fn print_banner() {
    println!();
    println!("{}", style(" reportbot ").bold().black().on_cyan());
    println!(
        "{}\n",
        style("Weekly reports, on request, from your project channels.").cyan()
    );
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("reportbot stopped.").bold().cyan());
}

enum GuideLine {
    Command(String, String),
    Status(String, String),
    Text(String),
    Hint(String, String),
    Blank,
}

/// A titled block of help text printed to stdout.
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, about: &str) -> Self {
        self.lines
            .push(GuideLine::Command(name.to_string(), about.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Text(text.to_string()));
        self
    }

    pub fn hint(mut self, example: &str, about: &str) -> Self {
        self.lines
            .push(GuideLine::Hint(example.to_string(), about.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(GuideLine::Blank);
        self
    }

    pub fn render(&self) -> String {
        let width = self
            .lines
            .iter()
            .filter_map(|l| match l {
                GuideLine::Command(name, _) => Some(name.chars().count()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let mut out = format!("\n {}\n", style(&self.title).bold().underlined());
        for line in &self.lines {
            match line {
                GuideLine::Command(name, about) => out.push_str(&format!(
                    "   {} {}\n",
                    style(format!("{:<width$}", name, width = width)).green(),
                    about
                )),
                GuideLine::Status(label, value) => {
                    out.push_str(&format!("   {}: {}\n", style(label).bold().cyan(), value))
                }
                GuideLine::Text(text) => out.push_str(&format!("   {}\n", text)),
                GuideLine::Hint(example, about) if about.is_empty() => {
                    out.push_str(&format!("   $ {}\n", style(example).dim()))
                }
                GuideLine::Hint(example, about) => {
                    out.push_str(&format!("   $ {}  {}\n", style(example).dim(), about))
                }
                GuideLine::Blank => out.push('\n'),
            }
        }
        out
    }

    pub fn print(self) {
        print!("{}", self.render());
    }
}

#[cfg(test)]
mod tests {
    use super::GuideSection;

    #[test]
    fn commands_are_aligned_under_the_title() {
        console::set_colors_enabled(false);
        let out = GuideSection::new("Service")
            .command("run", "Start polling")
            .command("check", "Validate the configuration")
            .blank()
            .hint("reportbot run --config bot.toml", "")
            .render();
        assert!(out.contains("Service"));
        assert!(out.contains("run   Start polling"));
        assert!(out.contains("check Validate the configuration"));
        assert!(out.contains("$ reportbot run --config bot.toml"));
    }
}
