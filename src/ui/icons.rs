//! Emoji with plain-text fallbacks for terminals that cannot render them.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("\u{2705} ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("\u{274C} ", "[ERR] ");
pub static SPARKLE: Emoji<'_, '_> = Emoji("\u{2728} ", "* ");
pub static ARROW: Emoji<'_, '_> = Emoji("\u{27A1}\u{FE0F}  ", "-> ");
pub static HOURGLASS: Emoji<'_, '_> = Emoji("\u{23F3} ", "[..] ");
pub static RETRY: Emoji<'_, '_> = Emoji("\u{1F504} ", "[RETRY] ");
pub static WARN: Emoji<'_, '_> = Emoji("\u{26A0}\u{FE0F}  ", "[!] ");
pub static THINKING: Emoji<'_, '_> = Emoji("\u{1F4AD} ", "... ");
