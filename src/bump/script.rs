//! Bump script model and parser.
//!
//! A bump script is a plain-text file containing one or more `<bump …>`
//! blocks. Each block is a timed sequence of cards (text, pauses, images)
//! with optional embedded sound effects, an optional outro, and a music or
//! video preference in the header. The parser is best-effort: malformed
//! tags are skipped, never fatal.

use std::path::{Path, PathBuf};

use crate::bump::library::AssetResolver;
use crate::bump::timing::{self, ScriptTiming};
use crate::config::{CardTimingConfig, Config};

const DEFAULT_OUTRO_TEXT: &str = "[sleepy shows]";
const DEFAULT_OUTRO_MS: u32 = 800;
const DEFAULT_PAUSE_MS: u32 = 1200;

/// How a card's duration participates in music fitting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DurationMode {
    /// Derived from character count; scalable.
    Auto,
    /// Explicit absolute duration; fixed.
    Abs,
    /// Auto baseline plus a signed fixed offset; the baseline scales.
    Delta,
    /// Pause or outro; never scaled.
    Fixed,
}

/// Timing fields shared by every card that can carry a duration override.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CardTiming {
    pub duration_ms: u32,
    pub mode: DurationMode,
    /// Readability-model baseline (clamped); the scalable portion.
    pub base_duration_ms: u32,
    /// Fixed signed adjustment applied on top of the baseline.
    pub delta_ms: i32,
}

impl CardTiming {
    fn fixed(duration_ms: u32) -> Self {
        Self {
            duration_ms,
            mode: DurationMode::Fixed,
            base_duration_ms: duration_ms,
            delta_ms: 0,
        }
    }
}

/// Sound mix behavior relative to the bump's music track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoundMix {
    Add,
    Interrupt,
    Cut,
}

/// How long an embedded sound effect plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoundSpan {
    /// For the lifetime of the containing card.
    Card,
    /// For the sound file's own duration.
    Duration,
    /// For an explicit number of milliseconds.
    Ms(u32),
}

/// An embedded `<sound …>` effect.
#[derive(Clone, Debug, PartialEq)]
pub struct SoundFx {
    pub filename: String,
    pub path: PathBuf,
    pub mix: SoundMix,
    pub span: SoundSpan,
}

/// Image sizing mode from `<img …>`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ImageMode {
    Default,
    /// Reserve exact text-line heights; carries the card's line count.
    Lines(u32),
    /// Inline at character height.
    Char,
    Percent(f64),
}

/// A referenced image asset.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRef {
    pub filename: String,
    pub path: PathBuf,
    pub mode: ImageMode,
}

/// A referenced video asset from the bump header.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoRef {
    pub filename: String,
    pub path: PathBuf,
    /// Bump cards render over the video instead of before it.
    pub inclusive: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextCard {
    pub text: String,
    pub timing: CardTiming,
    pub sound: Option<SoundFx>,
    /// Outro card requested outro audio playback.
    pub outro_audio: bool,
    pub is_outro: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PauseCard {
    pub duration_ms: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageCard {
    pub text_before: String,
    pub text_after: String,
    pub before_lines: u32,
    pub after_lines: u32,
    pub image: ImageRef,
    pub timing: CardTiming,
    pub sound: Option<SoundFx>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageCharCard {
    /// Card text with the image position marked by `[[IMG]]`.
    pub template: String,
    pub image: ImageRef,
    pub timing: CardTiming,
    pub sound: Option<SoundFx>,
}

/// One timeline element of a bump.
#[derive(Clone, Debug, PartialEq)]
pub enum Card {
    Text(TextCard),
    Pause(PauseCard),
    Image(ImageCard),
    ImageChar(ImageCharCard),
}

impl Card {
    pub fn duration_ms(&self) -> u32 {
        match self {
            Card::Text(card) => card.timing.duration_ms,
            Card::Pause(card) => card.duration_ms,
            Card::Image(card) => card.timing.duration_ms,
            Card::ImageChar(card) => card.timing.duration_ms,
        }
    }

    pub fn set_duration_ms(&mut self, ms: u32) {
        let ms = ms.max(1);
        match self {
            Card::Text(card) => card.timing.duration_ms = ms,
            Card::Pause(card) => card.duration_ms = ms,
            Card::Image(card) => card.timing.duration_ms = ms,
            Card::ImageChar(card) => card.timing.duration_ms = ms,
        }
    }

    pub fn mode(&self) -> DurationMode {
        match self {
            Card::Pause(_) => DurationMode::Fixed,
            Card::Text(card) => card.timing.mode,
            Card::Image(card) => card.timing.mode,
            Card::ImageChar(card) => card.timing.mode,
        }
    }

    pub fn base_duration_ms(&self) -> u32 {
        match self {
            Card::Pause(card) => card.duration_ms,
            Card::Text(card) => card.timing.base_duration_ms,
            Card::Image(card) => card.timing.base_duration_ms,
            Card::ImageChar(card) => card.timing.base_duration_ms,
        }
    }

    pub fn delta_ms(&self) -> i32 {
        match self {
            Card::Pause(_) => 0,
            Card::Text(card) => card.timing.delta_ms,
            Card::Image(card) => card.timing.delta_ms,
            Card::ImageChar(card) => card.timing.delta_ms,
        }
    }

    pub fn is_outro(&self) -> bool {
        matches!(self, Card::Text(card) if card.is_outro)
    }

    pub fn wants_outro_audio(&self) -> bool {
        matches!(self, Card::Text(card) if card.outro_audio)
    }

    pub fn sound(&self) -> Option<&SoundFx> {
        match self {
            Card::Pause(_) => None,
            Card::Text(card) => card.sound.as_ref(),
            Card::Image(card) => card.sound.as_ref(),
            Card::ImageChar(card) => card.sound.as_ref(),
        }
    }
}

/// A parsed bump script template.
#[derive(Clone, Debug)]
pub struct Script {
    pub cards: Vec<Card>,
    /// `"any"` or an exact music basename request.
    pub music_pref: String,
    pub video: Option<VideoRef>,
    /// Stable identity for exposure scoring (`file#bumpN`).
    pub script_key: String,
    /// Pre-scaling duration estimate; used for heuristics and diagnostics.
    pub estimated_ms: u32,
    pub timing: ScriptTiming,
}

impl Script {
    pub fn is_video_bump(&self) -> bool {
        self.video
            .as_ref()
            .is_some_and(|video| !video.path.as_os_str().is_empty())
    }

    pub fn needs_outro_audio(&self) -> bool {
        self.cards.iter().any(Card::wants_outro_audio)
    }
}

/// Parses every bump block in a script file's text.
///
/// `source_path` feeds the stable script key and same-directory asset
/// resolution; in-memory scripts get synthetic `mem:` keys.
pub fn parse_script_text(
    content: &str,
    source_path: Option<&Path>,
    resolver: &AssetResolver,
    config: &Config,
) -> Vec<Script> {
    let mut scripts = Vec::new();
    let headers = find_bump_headers(content);
    if headers.is_empty() {
        return scripts;
    }

    let base_dir = source_path.and_then(Path::parent);
    for (i, (start, end)) in headers.iter().enumerate() {
        let header = &content[*start..*end];
        let body_end = headers.get(i + 1).map_or(content.len(), |next| next.0);
        let body = &content[*end..body_end];
        let script_key = match source_path {
            Some(path) => format!("{}#bump{}", normpath_display(path), i),
            None => format!("mem:{i}"),
        };
        if let Some(script) = parse_single_bump(body, header, base_dir, script_key, resolver, config)
        {
            scripts.push(script);
        }
    }
    scripts
}

fn normpath_display(path: &Path) -> String {
    // Keep the key stable across "./" style prefixes.
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out.to_string_lossy().into_owned()
}

/// Readability duration for a card's timing text.
pub fn card_duration_ms_for_text(text: &str, config: &CardTimingConfig) -> u32 {
    let single_line = is_single_line_card(text);
    let normalized = normalize_card_text(text);
    let chars = normalized.chars().count() as f64;
    let mut ms = (f64::from(config.base_card_ms)
        + chars * f64::from(config.ms_per_char) * config.ms_per_char_scale)
        * config.duration_scale;
    if single_line {
        ms += f64::from(config.one_line_bonus_ms);
    }
    ms *= config.estimate_scale;
    let ms = ms as u32;
    ms.clamp(config.min_card_ms, config.max_card_ms)
}

fn normalize_card_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_single_line_card(text: &str) -> bool {
    text.trim()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count()
        <= 1
}

fn clamp_card_duration_ms(ms: u32, config: &CardTimingConfig) -> u32 {
    ms.clamp(config.min_card_ms, config.max_card_ms)
}

// --- Tag scanning -----------------------------------------------------------

/// Byte ranges of `<bump …>` headers, in order.
fn find_bump_headers(content: &str) -> Vec<(usize, usize)> {
    let mut headers = Vec::new();
    let mut from = 0;
    while let Some((start, end)) = find_tag(content, from, &["bump"], false) {
        headers.push((start, end));
        from = end;
    }
    headers
}

/// Finds the next `<name …>` tag at or after `from`. Word-boundary checked;
/// `allow_ws` permits whitespace between `<` and the name.
fn find_tag(content: &str, from: usize, names: &[&str], allow_ws: bool) -> Option<(usize, usize)> {
    let bytes = content.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let mut name_start = i + 1;
        if allow_ws {
            while name_start < bytes.len() && (bytes[name_start] as char).is_whitespace() {
                name_start += 1;
            }
        }
        for name in names {
            if matches_tag_name(content, name_start, name) {
                if let Some(close) = content[name_start..].find('>') {
                    return Some((i, name_start + close + 1));
                }
            }
        }
        i += 1;
    }
    None
}

fn matches_tag_name(content: &str, at: usize, name: &str) -> bool {
    let Some(rest) = content.get(at..) else {
        return false;
    };
    let Some(head) = rest.get(..name.len()) else {
        return false;
    };
    if !head.eq_ignore_ascii_case(name) {
        return false;
    }
    // Word boundary: the name must not continue into an identifier.
    match rest[name.len()..].chars().next() {
        Some(c) => !(c.is_ascii_alphanumeric() || c == '_'),
        None => false,
    }
}

/// Splits `<tag payload>` into its inner payload string.
fn tag_payload<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let trimmed = tag.trim();
    let inner = trimmed.strip_prefix('<')?.strip_suffix('>')?;
    let inner = inner.trim_start();
    if !inner.get(..name.len())?.eq_ignore_ascii_case(name) {
        return None;
    }
    Some(inner[name.len()..].trim())
}

/// Removes every quoted segment so a quoted word can't trigger a bare flag.
fn strip_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '"' || c == '\'' {
            for d in chars.by_ref() {
                if d == c {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// First quoted value anywhere in `s`.
fn first_quoted(s: &str) -> Option<String> {
    let mut chars = s.char_indices();
    while let Some((_, c)) = chars.next() {
        if c == '"' || c == '\'' {
            let mut value = String::new();
            for (_, d) in chars.by_ref() {
                if d == c {
                    return Some(value);
                }
                value.push(d);
            }
            return None;
        }
    }
    None
}

fn has_bare_word(s: &str, word: &str) -> bool {
    strip_quoted(s)
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token.eq_ignore_ascii_case(word))
}

/// Shell-ish token split honoring quotes; used by `<sound>`/`<img>` payloads.
fn split_tokens(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in raw.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                } else if c.is_whitespace() {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                } else {
                    current.push(c);
                }
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

// --- Header attribute parsing ----------------------------------------------

/// Value following `key=` in a header; quoted values are taken verbatim,
/// unquoted values run until the next `attr=` or the tag end.
fn header_attr_value(header: &str, key: &str) -> Option<String> {
    // ASCII folding keeps byte offsets aligned with `header`.
    let lower = header.to_ascii_lowercase();
    let mut search_from = 0;
    let rest = loop {
        let at = lower[search_from..].find(key)? + search_from;
        let boundary_ok = !lower[..at]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        let after_key = header[at + key.len()..].trim_start();
        if boundary_ok {
            if let Some(value) = after_key.strip_prefix('=') {
                break value.trim_start();
            }
        }
        search_from = at + key.len();
    };

    if rest.starts_with('"') || rest.starts_with('\'') {
        return first_quoted(rest);
    }

    let mut value = rest.trim_end_matches('>').trim().to_string();
    // Stop before another attribute like " foo=bar".
    if let Some(cut) = find_next_attr(&value) {
        value.truncate(cut);
        value = value.trim().to_string();
    }
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Offset of the next ` word=` attribute inside an unquoted value run.
fn find_next_attr(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if (bytes[i] as char).is_whitespace() {
            let word_start = i + 1;
            let mut j = word_start;
            while j < bytes.len() && ((bytes[j] as char).is_ascii_alphanumeric() || bytes[j] == b'_' || bytes[j] == b'-')
            {
                j += 1;
            }
            if j > word_start && j < bytes.len() && bytes[j] == b'=' {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn parse_music_pref(header: &str) -> String {
    header_attr_value(header, "music").unwrap_or_else(|| "any".to_string())
}

fn parse_video_pref(header: &str) -> Option<String> {
    let raw = header_attr_value(header, "video")?;
    // A quoted value may legitimately contain spaces.
    let had_quotes = {
        let lower = header.to_ascii_lowercase();
        lower.find("video").is_some_and(|at| {
            header[at + "video".len()..]
                .trim_start()
                .strip_prefix('=')
                .map(str::trim_start)
                .is_some_and(|rest| rest.starts_with('"') || rest.starts_with('\''))
        })
    };
    if had_quotes {
        return Some(raw);
    }

    let mut parts: Vec<&str> = raw.split_whitespace().collect();
    if parts.last().is_some_and(|last| last.eq_ignore_ascii_case("inclusive")) {
        parts.pop();
    }
    // Unquoted filenames with spaces are ambiguous; require quotes.
    if parts.len() != 1 {
        return None;
    }
    Some(parts[0].trim_matches(|c| c == '"' || c == '\'').to_string())
}

fn parse_inclusive_flag(header: &str) -> bool {
    has_bare_word(header, "inclusive")
}

// --- Card/outro/pause tag parsing ------------------------------------------

fn parse_pause_ms(tag: &str) -> u32 {
    // First digit run wins; units are not honored here.
    let digits: String = tag
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(DEFAULT_PAUSE_MS)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DurationSpec {
    Abs(u32),
    Delta(i32),
}

/// `<card [+|-]N[ms|s]>` duration override.
fn parse_card_duration_spec(tag: &str) -> Option<DurationSpec> {
    let payload = tag_payload(tag, "card")?;
    if payload.is_empty() {
        return None;
    }
    parse_signed_duration(payload)
}

fn parse_signed_duration(payload: &str) -> Option<DurationSpec> {
    let payload = payload.trim();
    let (sign, rest) = match payload.chars().next()? {
        '+' => (Some(1i32), payload[1..].trim_start()),
        '-' => (Some(-1i32), payload[1..].trim_start()),
        _ => (None, payload),
    };
    let (value, unit) = split_duration_token(rest)?;
    let ms = match unit {
        Unit::Seconds => (value * 1000.0).round() as u32,
        Unit::Millis => value.round() as u32,
    };
    match sign {
        Some(s) => Some(DurationSpec::Delta(s * ms as i32)),
        None => Some(DurationSpec::Abs(ms)),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Unit {
    Millis,
    Seconds,
}

/// `NUMBER[ms|s]` with optional whitespace before the unit; ms by default.
fn split_duration_token(s: &str) -> Option<(f64, Unit)> {
    let s = s.trim();
    let digits_end = s
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let value: f64 = s[..digits_end].parse().ok()?;
    let unit = s[digits_end..].trim();
    match unit.to_lowercase().as_str() {
        "" => Some((value, Unit::Millis)),
        "ms" => Some((value, Unit::Millis)),
        "s" => Some((value, Unit::Seconds)),
        _ => None,
    }
}

fn parse_outro_text(tag: &str) -> String {
    if let Some(quoted) = first_quoted(tag) {
        let trimmed = quoted.trim();
        if trimmed.is_empty() {
            return DEFAULT_OUTRO_TEXT.to_string();
        }
        return trimmed.to_string();
    }

    let Some(payload) = tag_payload(tag, "outro") else {
        return DEFAULT_OUTRO_TEXT.to_string();
    };
    let mut payload = payload.trim().to_string();
    if let Some(stripped) = payload.strip_prefix('=') {
        payload = stripped.trim().to_string();
    }
    // Drop a standalone trailing "audio" flag, then a trailing duration token.
    let mut words: Vec<&str> = payload.split_whitespace().collect();
    if words.last().is_some_and(|w| w.eq_ignore_ascii_case("audio")) {
        words.pop();
    }
    if words
        .last()
        .is_some_and(|w| split_duration_token(w).is_some())
    {
        words.pop();
    }
    let text = words.join(" ");
    if text.is_empty() {
        DEFAULT_OUTRO_TEXT.to_string()
    } else {
        text
    }
}

fn parse_outro_duration_ms(tag: &str) -> u32 {
    let stripped = strip_quoted(tag);
    let Some(payload) = tag_payload(&stripped, "outro") else {
        return DEFAULT_OUTRO_MS;
    };
    let mut best = None;
    for token in payload.split_whitespace() {
        let token = token.trim_start_matches('=');
        if token.eq_ignore_ascii_case("audio") || token.is_empty() {
            continue;
        }
        if let Some((value, unit)) = split_duration_token(token) {
            best = Some(match unit {
                Unit::Seconds => (value * 1000.0).round() as u32,
                Unit::Millis => value.round() as u32,
            });
        }
    }
    best.unwrap_or(DEFAULT_OUTRO_MS)
}

fn parse_outro_audio_flag(tag: &str) -> bool {
    has_bare_word(tag, "audio")
}

fn parse_sound_tag(tag: &str, base_dir: Option<&Path>, resolver: &AssetResolver) -> Option<SoundFx> {
    let payload = tag_payload(tag, "sound")?;
    if payload.is_empty() {
        return None;
    }
    let tokens = split_tokens(payload);

    let mut filename: Option<String> = None;
    let mut mix = SoundMix::Add;
    let mut span = SoundSpan::Card;
    for token in &tokens {
        let lower = token.to_lowercase();
        match lower.as_str() {
            "add" => mix = SoundMix::Add,
            "interrupt" => mix = SoundMix::Interrupt,
            "cut" => mix = SoundMix::Cut,
            "duration" => span = SoundSpan::Duration,
            "card" => span = SoundSpan::Card,
            _ => {
                // Explicit play length requires a unit: "500ms" / "5s".
                if lower.ends_with("ms") || lower.ends_with('s') {
                    if let Some((value, unit)) = split_duration_token(&lower) {
                        span = SoundSpan::Ms(match unit {
                            Unit::Seconds => (value * 1000.0).round() as u32,
                            Unit::Millis => value.round() as u32,
                        });
                        continue;
                    }
                }
                if filename.is_none() {
                    filename = Some(token.clone());
                }
            }
        }
    }

    let filename = filename?;
    let path = resolver.resolve_sound(&filename, base_dir);
    Some(SoundFx {
        filename,
        path,
        mix,
        span,
    })
}

fn parse_img_tag(
    tag: &str,
    base_dir: Option<&Path>,
    full_card_text: &str,
    resolver: &AssetResolver,
) -> Option<ImageRef> {
    let payload = tag_payload(tag, "img")?;
    if payload.is_empty() {
        return None;
    }
    let tokens = split_tokens(payload);

    let mut filename: Option<String> = None;
    let mut mode = ImageMode::Default;
    for token in &tokens {
        let lower = token.to_lowercase();
        if lower == "lines" {
            mode = ImageMode::Lines(0);
            continue;
        }
        if lower == "char" {
            mode = ImageMode::Char;
            continue;
        }
        if let Some(num) = lower.strip_suffix('%') {
            if let Ok(percent) = num.parse::<f64>() {
                mode = ImageMode::Percent(percent);
                continue;
            }
        }
        if filename.is_none() {
            filename = Some(token.clone());
        }
    }

    let filename = filename?;
    if let ImageMode::Lines(_) = mode {
        let cleaned = strip_markup_tags(full_card_text);
        let cleaned = cleaned.replace("\r\n", "\n").replace('\r', "\n");
        let count = if cleaned.trim().is_empty() {
            0
        } else {
            cleaned.split('\n').count() as u32
        };
        mode = ImageMode::Lines(count);
    }

    let path = resolver.resolve_image(&filename, base_dir);
    Some(ImageRef {
        filename,
        path,
        mode,
    })
}

/// Removes `<img …>` and `<sound …>` markup from card text.
fn strip_markup_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut from = 0;
    while let Some((start, end)) = find_tag(text, from, &["img", "sound"], true) {
        out.push_str(&text[from..start]);
        from = end;
    }
    out.push_str(&text[from..]);
    out
}

fn strip_sound_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut from = 0;
    while let Some((start, end)) = find_tag(text, from, &["sound"], true) {
        out.push_str(&text[from..start]);
        from = end;
    }
    out.push_str(&text[from..]);
    out
}

/// Expands explicit whitespace tags (`<\s>`, `<\t>`, `<\n>`).
fn expand_whitespace_tags(text: &str) -> String {
    text.replace("<\\s>", " ")
        .replace("<\\t>", "\t")
        .replace("<\\n>", "\n")
}

fn has_whitespace_tag(line: &str) -> bool {
    line.contains("<\\s>") || line.contains("<\\t>") || line.contains("<\\n>")
}

/// Converts whitespace-only lines to NBSP so the renderer keeps line height.
fn display_text_preserve_blank_lines(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.is_empty() {
        return String::new();
    }
    normalized
        .split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                "\u{00A0}".to_string()
            } else {
                line.trim_end().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn count_lines_preserve_trailing(text: &str) -> u32 {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.trim().is_empty() {
        0
    } else {
        normalized.split('\n').count() as u32
    }
}

// --- Bump assembly ----------------------------------------------------------

struct CardAccumulator {
    /// (expanded line, was authored via explicit whitespace tags)
    lines: Vec<(String, bool)>,
    duration_spec: Option<DurationSpec>,
}

impl CardAccumulator {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            duration_spec: None,
        }
    }

    fn push_fragment(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        let normalized = fragment.replace("\r\n", "\n").replace('\r', "\n");
        for line in normalized.split('\n') {
            let explicit_blank = has_whitespace_tag(line);
            let expanded = expand_whitespace_tags(line);
            if expanded.trim().is_empty() {
                self.lines.push((String::new(), explicit_blank));
            } else {
                self.lines.push((expanded.trim_end().to_string(), false));
            }
        }
    }
}

fn parse_single_bump(
    body: &str,
    header: &str,
    base_dir: Option<&Path>,
    script_key: String,
    resolver: &AssetResolver,
    config: &Config,
) -> Option<Script> {
    let music_pref = parse_music_pref(header);
    let video = parse_video_pref(header).map(|name| VideoRef {
        path: resolver.resolve_video(&name, base_dir),
        inclusive: parse_inclusive_flag(header),
        filename: name,
    });

    let mut cards: Vec<Card> = Vec::new();
    let mut acc = CardAccumulator::new();

    let finalize = |acc: &mut CardAccumulator, cards: &mut Vec<Card>| {
        finalize_card(acc, cards, base_dir, resolver, &config.cards);
    };

    let mut from = 0;
    while let Some((start, end)) = find_tag(body, from, &["card", "outro", "pause"], false) {
        acc.push_fragment(&body[from..start]);
        let tag = &body[start..end];
        let tag_lower = tag.to_lowercase();
        if tag_lower.starts_with("<card") {
            finalize(&mut acc, &mut cards);
            acc.duration_spec = parse_card_duration_spec(tag);
        } else if tag_lower.starts_with("<outro") {
            finalize(&mut acc, &mut cards);
            cards.push(Card::Text(TextCard {
                text: parse_outro_text(tag),
                timing: CardTiming::fixed(parse_outro_duration_ms(tag)),
                sound: None,
                outro_audio: parse_outro_audio_flag(tag),
                is_outro: true,
            }));
            acc.duration_spec = None;
        } else {
            finalize(&mut acc, &mut cards);
            cards.push(Card::Pause(PauseCard {
                duration_ms: parse_pause_ms(tag),
            }));
            acc.duration_spec = None;
        }
        from = end;
    }
    acc.push_fragment(&body[from..]);
    finalize(&mut acc, &mut cards);

    if cards.is_empty() {
        return None;
    }

    let timing = timing::analyze_cards(&cards, &config.fitter);
    let estimated_ms = timing.estimated_ms;

    let script = Script {
        cards,
        music_pref,
        video,
        script_key,
        estimated_ms,
        timing,
    };

    // Reject scripts that cannot possibly fit under the target cap, even at
    // maximum scaling. Video bumps don't require music fitting.
    if script.is_video_bump() || timing::can_fit_any_track(&script.timing, &config.fitter) {
        Some(script)
    } else {
        None
    }
}

fn finalize_card(
    acc: &mut CardAccumulator,
    cards: &mut Vec<Card>,
    base_dir: Option<&Path>,
    resolver: &AssetResolver,
    cards_config: &CardTimingConfig,
) {
    if acc.lines.is_empty() {
        acc.duration_spec = None;
        return;
    }

    let mut lines = std::mem::take(&mut acc.lines);
    let duration_spec = acc.duration_spec.take();

    // Trim incidental blank lines around tags, keep explicit ones.
    while lines
        .first()
        .is_some_and(|(text, explicit)| text.is_empty() && !explicit)
    {
        lines.remove(0);
    }
    while lines
        .last()
        .is_some_and(|(text, explicit)| text.is_empty() && !explicit)
    {
        lines.pop();
    }

    let raw_text = lines
        .iter()
        .map(|(text, _)| text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let has_explicit_blank = lines.iter().any(|(_, explicit)| *explicit);

    // Intentionally blank cards survive only with explicit whitespace tags or
    // an explicit duration.
    if raw_text.trim().is_empty() && !has_explicit_blank && duration_spec.is_none() {
        return;
    }

    let timing_text = strip_markup_tags(&raw_text);
    let standard_duration = card_duration_ms_for_text(&timing_text, cards_config);

    let mut mode = DurationMode::Auto;
    let mut base_duration_ms = standard_duration;
    let mut delta_ms: i32 = 0;
    let mut duration = standard_duration;
    match duration_spec {
        Some(DurationSpec::Abs(ms)) => {
            duration = ms;
            mode = DurationMode::Abs;
        }
        Some(DurationSpec::Delta(ms)) => {
            delta_ms = ms;
            mode = DurationMode::Delta;
        }
        None => {}
    }

    // Clamp only the readability baseline; abs overrides and deltas are
    // literal time adjustments.
    base_duration_ms = clamp_card_duration_ms(base_duration_ms, cards_config);
    match mode {
        DurationMode::Auto => duration = base_duration_ms,
        DurationMode::Delta => {
            duration = (base_duration_ms as i64 + i64::from(delta_ms)).max(1) as u32;
        }
        _ => {}
    }
    let duration = duration.max(1);

    let timing = CardTiming {
        duration_ms: duration,
        mode,
        base_duration_ms,
        delta_ms,
    };

    let sound = find_tag(&raw_text, 0, &["sound"], true)
        .and_then(|(start, end)| parse_sound_tag(&raw_text[start..end], base_dir, resolver));

    if let Some((img_start, img_end)) = find_tag(&raw_text, 0, &["img"], true) {
        let img_tag = &raw_text[img_start..img_end];
        if let Some(image) = parse_img_tag(img_tag, base_dir, &raw_text, resolver) {
            if !image.path.as_os_str().is_empty() {
                let before = strip_sound_markup(&raw_text[..img_start]);
                let after = strip_sound_markup(&raw_text[img_end..]);
                let card = if image.mode == ImageMode::Char {
                    let template = format!("{}[[IMG]]{}", before, after);
                    Card::ImageChar(ImageCharCard {
                        template,
                        image,
                        timing,
                        sound,
                    })
                } else {
                    let before = before.trim_end();
                    let after = after.trim_start();
                    Card::Image(ImageCard {
                        text_before: display_text_preserve_blank_lines(before),
                        text_after: display_text_preserve_blank_lines(after),
                        before_lines: count_lines_preserve_trailing(before),
                        after_lines: count_lines_preserve_trailing(after),
                        image,
                        timing,
                        sound,
                    })
                };
                cards.push(card);
                return;
            }
        }
    }

    let display = display_text_preserve_blank_lines(&strip_sound_markup(&raw_text));
    cards.push(Card::Text(TextCard {
        text: display,
        timing,
        sound,
        outro_audio: false,
        is_outro: false,
    }));
}
