use watchline::{OutboundEvent, ParseStatus, SecondaryEffect};

mod ansi {
    pub const RESET: &str = "\x1b[0m";
    pub const DIM: &str = "\x1b[2m";
    pub const BOLD: &str = "\x1b[1m";

    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const RED: &str = "\x1b[31m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GRAY: &str = "\x1b[90m";

    pub struct Palette {
        enabled: bool,
    }

    impl Palette {
        pub fn new(enabled: bool) -> Self {
            Self { enabled }
        }

        pub fn paint(&self, s: impl AsRef<str>, color: &str) -> String {
            if self.enabled { format!("{}{}{}", color, s.as_ref(), RESET) } else { s.as_ref().to_string() }
        }

        pub fn bold(&self, s: impl AsRef<str>) -> String {
            if self.enabled { format!("{}{}{}", BOLD, s.as_ref(), RESET) } else { s.as_ref().to_string() }
        }

        pub fn dim(&self, s: impl AsRef<str>) -> String {
            if self.enabled { format!("{}{}{}", DIM, s.as_ref(), RESET) } else { s.as_ref().to_string() }
        }
    }
}

pub fn print_events(events: &[OutboundEvent], color: bool) {
    let palette = ansi::Palette::new(color);
    for event in events {
        match event {
            OutboundEvent::CreateComponent { instance_id, kind, label, duration_ms, .. } => {
                println!(
                    "{} {} {:?} {} ({}s)",
                    palette.paint("▶", ansi::GREEN),
                    palette.dim(format!("#{instance_id}")),
                    kind,
                    palette.bold(label),
                    duration_ms / 1000
                );
            }
            OutboundEvent::DestroyComponent { instance_id } => {
                println!("{} {}", palette.paint("■", ansi::GRAY), palette.dim(format!("#{instance_id} ended")));
            }
            OutboundEvent::SecondaryAction { instance_id, effect } => {
                let what = match effect {
                    SecondaryEffect::AdjustStart => "restarted",
                    SecondaryEffect::WornOff => "worn off",
                };
                println!("{} {}", palette.paint("↻", ansi::YELLOW), palette.dim(format!("#{instance_id} {what}")));
            }
            OutboundEvent::DisplayText { text } => {
                println!("{} {}", palette.paint("✦", ansi::CYAN), palette.bold(text));
            }
            OutboundEvent::Speak { text, .. } => {
                println!("{} {}", palette.paint("🕪", ansi::CYAN), text);
            }
            OutboundEvent::WriteClipboard { text } => {
                println!("{} {}", palette.paint("⧉", ansi::GRAY), palette.dim(text));
            }
            OutboundEvent::PlayAudio { file_id } => {
                println!("{} {}", palette.paint("♪", ansi::GRAY), palette.dim(file_id));
            }
            OutboundEvent::ScreenGlow { color, .. } => {
                println!("{} {}", palette.paint("▒", ansi::YELLOW), palette.dim(format!("glow {color}")));
            }
            OutboundEvent::DeathRecap => {
                println!("{}", palette.paint("☠ death recap requested", ansi::RED));
            }
            OutboundEvent::Diagnostics { entries } => print_diagnostics(entries, &palette),
        }
    }
}

fn print_diagnostics(entries: &[watchline::ParseHistoryEntry], palette: &ansi::Palette) {
    for entry in entries {
        match entry.status {
            ParseStatus::Success => {
                println!(
                    "{} {} {}",
                    palette.paint("✓", ansi::GREEN),
                    palette.dim(&entry.trigger_id),
                    palette.dim(&entry.line)
                );
            }
            ParseStatus::Failure => {
                println!(
                    "{} {} {}",
                    palette.paint("✗", ansi::GRAY),
                    palette.dim(&entry.trigger_id),
                    palette.dim(entry.condition.as_deref().unwrap_or(""))
                );
            }
            ParseStatus::Exception => {
                println!(
                    "{} {} {}",
                    palette.paint("‼", ansi::RED),
                    palette.bold(&entry.trigger_id),
                    entry.error.as_deref().unwrap_or("")
                );
            }
        }
    }
}
