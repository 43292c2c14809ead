//! Neon ASCII banner with a vertical gradient (CLOUD-BACKUP).

use crossterm::ExecutableCommand;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use figlet_rs::FIGfont;
use std::io::{Write, stdout};

/// Sky Blue (#38bdf8).
const SKY_BLUE: (u8, u8, u8) = (0x38, 0xbd, 0xf8);
/// Mint (#34d399).
const MINT: (u8, u8, u8) = (0x34, 0xd3, 0x99);

const TITLE: &str = "CLOUD-BACKUP";

/// Linear interpolation between two RGB colors. `t` in [0.0, 1.0].
fn lerp_rgb(a: (u8, u8, u8), b: (u8, u8, u8), t: f64) -> (u8, u8, u8) {
    let mix = |x: u8, y: u8| (f64::from(x) * (1.0 - t) + f64::from(y) * t).round() as u8;
    (mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}

/// Banner lines. Falls back to the plain title if the figlet font cannot render.
fn render() -> Vec<String> {
    FIGfont::standard()
        .ok()
        .and_then(|font| font.convert(TITLE).map(|f| f.to_string()))
        .map(|art| art.lines().map(str::to_string).collect())
        .unwrap_or_else(|| vec![TITLE.to_string()])
}

/// Prints the title with a gradient from sky blue to mint, then the version.
pub fn print_welcome() {
    let mut out = stdout();
    let lines = render();
    let total = lines.len().max(1);

    for (i, line) in lines.iter().enumerate() {
        let t = if total <= 1 {
            1.0
        } else {
            i as f64 / (total - 1) as f64
        };
        let (r, g, b) = lerp_rgb(SKY_BLUE, MINT, t);
        let _ = out.execute(SetForegroundColor(Color::Rgb { r, g, b }));
        let _ = out.execute(Print(line));
        let _ = out.execute(Print("\r\n"));
        let _ = out.execute(ResetColor);
    }

    let _ = out.execute(SetForegroundColor(Color::Rgb {
        r: MINT.0,
        g: MINT.1,
        b: MINT.2,
    }));
    let _ = out.execute(Print(format!(
        "v{}  database backups to Google Drive\r\n",
        env!("CARGO_PKG_VERSION")
    )));
    let _ = out.execute(ResetColor);
    let _ = out.flush();
}
