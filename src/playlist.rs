//! Playlist model.
//!
//! A playlist is UTF-8 text with one entry per line:
//!
//! ```text
//! # comment            ; comment            // comment
//! shows/episode01.mp4 :Season premiere
//! :Intermission        (separator, annotation only)
//! %RESTART | %INSTANT_RESTART | %STOP | %MAIL <text>
//! ```
//!
//! Comments and blank lines never become entries. Each remaining line is
//! resolved once, at parse time, into exactly one [`EntryKind`].

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::normalize_pattern;
use crate::error::ParseError;

const SEPARATOR_MARKER: char = ':';
const COMMAND_MARKER: char = '%';
const EXTRA_INFO_DELIMITER: &str = " :";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Restart,
    InstantRestart,
    Stop,
    Mail(Option<String>),
    /// Unrecognised keyword; consumed as a no-op.
    Unknown(String),
}

impl Command {
    pub fn keyword(&self) -> &str {
        match self {
            Command::Restart => "RESTART",
            Command::InstantRestart => "INSTANT_RESTART",
            Command::Stop => "STOP",
            Command::Mail(_) => "MAIL",
            Command::Unknown(k) => k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Playable {
        /// Path as written in the playlist (used for names and exclusion).
        source: String,
        /// `source` resolved against the media base directory.
        path: PathBuf,
        extra_info: Option<String>,
        excluded_from_schedule: bool,
    },
    Separator {
        extra_info: String,
    },
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    /// Position in the playlist (cursor space).
    pub index: usize,
    /// 1-based line number in the source text, for logs and history.
    pub line: usize,
    pub kind: EntryKind,
}

impl PlaylistEntry {
    /// Playlist name of a playable entry: its written path minus extension.
    pub fn name(&self) -> Option<String> {
        match &self.kind {
            EntryKind::Playable { source, .. } => Some(strip_extension(source)),
            _ => None,
        }
    }

    pub fn extra_info(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Playable { extra_info, .. } => extra_info.as_deref(),
            EntryKind::Separator { extra_info } => Some(extra_info),
            EntryKind::Command(_) => None,
        }
    }

    pub fn is_playable(&self) -> bool {
        matches!(self.kind, EntryKind::Playable { .. })
    }
}

/// Load-time inputs that shape entries.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub base: PathBuf,
    /// Already case-folded prefixes (see [`normalize_pattern`]).
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    entries: Vec<PlaylistEntry>,
}

impl Playlist {
    /// Strict parse: the first malformed command line is an error.
    pub fn parse(text: &str, opts: &ParseOptions) -> Result<Self, ParseError> {
        let mut entries = Vec::new();
        for (line_no, raw) in source_lines(text) {
            if let Some(kind) = parse_line(raw, line_no, opts)? {
                entries.push(PlaylistEntry { index: entries.len(), line: line_no, kind });
            }
        }
        Ok(Self { entries })
    }

    /// Parse that logs and skips malformed command lines.
    pub fn parse_lossy(text: &str, opts: &ParseOptions) -> Self {
        let mut entries = Vec::new();
        for (line_no, raw) in source_lines(text) {
            match parse_line(raw, line_no, opts) {
                Ok(Some(kind)) => {
                    debug!("playlist line {line_no}: {kind:?}");
                    entries.push(PlaylistEntry { index: entries.len(), line: line_no, kind });
                }
                Ok(None) => {}
                Err(e) => warn!("skipping playlist entry: {e}"),
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlaylistEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    pub fn playable_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_playable()).count()
    }
}

fn source_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    text.lines().enumerate().map(|(i, l)| (i + 1, l))
}

fn parse_line(raw: &str, line: usize, opts: &ParseOptions) -> Result<Option<EntryKind>, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || is_comment(trimmed) {
        return Ok(None);
    }

    if let Some(rest) = trimmed.strip_prefix(SEPARATOR_MARKER) {
        return Ok(Some(EntryKind::Separator { extra_info: rest.to_string() }));
    }

    if let Some(rest) = trimmed.strip_prefix(COMMAND_MARKER) {
        return parse_command(rest, line).map(|c| Some(EntryKind::Command(c)));
    }

    let (source, extra_info) = match trimmed.split_once(EXTRA_INFO_DELIMITER) {
        Some((p, info)) => (p.trim_end(), Some(info.to_string())),
        None => (trimmed, None),
    };
    let written = Path::new(source);
    let path = if written.is_absolute() { written.to_path_buf() } else { opts.base.join(written) };
    let folded = normalize_pattern(source);
    let excluded_from_schedule = opts.exclude_patterns.iter().any(|p| folded.starts_with(p.as_str()));

    Ok(Some(EntryKind::Playable {
        source: source.to_string(),
        path,
        extra_info,
        excluded_from_schedule,
    }))
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with(';') || line.starts_with("//")
}

fn parse_command(rest: &str, line: usize) -> Result<Command, ParseError> {
    let (keyword, args) = match rest.split_once(char::is_whitespace) {
        Some((k, a)) => (k, a.trim()),
        None => (rest, ""),
    };
    if keyword.is_empty() {
        return Err(ParseError { line, reason: "command marker without a keyword".into() });
    }

    let no_args = |cmd: Command| {
        if args.is_empty() {
            Ok(cmd)
        } else {
            Err(ParseError {
                line,
                reason: format!("%{} does not take arguments (got {args:?})", cmd.keyword()),
            })
        }
    };

    match keyword {
        "RESTART" => no_args(Command::Restart),
        "INSTANT_RESTART" => no_args(Command::InstantRestart),
        "STOP" => no_args(Command::Stop),
        "MAIL" => Ok(Command::Mail(if args.is_empty() { None } else { Some(args.to_string()) })),
        other => Ok(Command::Unknown(other.to_string())),
    }
}

fn strip_extension(source: &str) -> String {
    let p = Path::new(source);
    match (p.extension(), p.file_stem()) {
        (Some(_), Some(stem)) => match p.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                parent.join(stem).to_string_lossy().into_owned()
            }
            _ => stem.to_string_lossy().into_owned(),
        },
        _ => source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ParseOptions {
        ParseOptions {
            base: PathBuf::from("/media"),
            exclude_patterns: vec![normalize_pattern("Bumpers/"), normalize_pattern("ADS")],
        }
    }

    const SAMPLE: &str = "\u{feff}# header comment\n\
        shows/ep01.mp4 :Pilot\n\
        \n\
        ; another comment\n\
        // and another\n\
        :Intermission\n\
        /abs/movie.mkv\n\
        bumpers/station_id.mp4\n\
        ads\\spot.mp4\n\
        %RESTART\n\
        %MAIL Check the encoder\n\
        %MAIL\n\
        %WHATEVER now\n\
        %STOP\n";

    #[test]
    fn parses_every_line_kind() {
        let pl = Playlist::parse(SAMPLE, &opts()).unwrap();
        assert_eq!(pl.len(), 11);

        let first = pl.get(0).unwrap();
        assert_eq!(first.line, 2);
        assert_eq!(first.name().as_deref(), Some("shows/ep01"));
        assert_eq!(first.extra_info(), Some("Pilot"));
        match &first.kind {
            EntryKind::Playable { path, excluded_from_schedule, .. } => {
                assert_eq!(path, &PathBuf::from("/media/shows/ep01.mp4"));
                assert!(!excluded_from_schedule);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(pl.get(1).unwrap().kind, EntryKind::Separator { extra_info: "Intermission".into() });
        match &pl.get(2).unwrap().kind {
            EntryKind::Playable { path, extra_info, .. } => {
                assert_eq!(path, &PathBuf::from("/abs/movie.mkv"));
                assert_eq!(extra_info, &None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            pl.get(3).unwrap().kind,
            EntryKind::Playable { excluded_from_schedule: true, .. }
        ));
        assert!(matches!(
            pl.get(4).unwrap().kind,
            EntryKind::Playable { excluded_from_schedule: true, .. }
        ));
        assert_eq!(pl.get(5).unwrap().kind, EntryKind::Command(Command::Restart));
        assert_eq!(
            pl.get(6).unwrap().kind,
            EntryKind::Command(Command::Mail(Some("Check the encoder".into())))
        );
        assert_eq!(pl.get(7).unwrap().kind, EntryKind::Command(Command::Mail(None)));
        assert_eq!(pl.get(8).unwrap().kind, EntryKind::Command(Command::Unknown("WHATEVER".into())));
        assert_eq!(pl.get(9).unwrap().kind, EntryKind::Command(Command::Stop));
        assert_eq!(pl.playable_count(), 4);
    }

    #[test]
    fn reparsing_is_idempotent() {
        let a = Playlist::parse(SAMPLE, &opts()).unwrap();
        let b = Playlist::parse(SAMPLE, &opts()).unwrap();
        assert_eq!(a, b);
        assert_eq!(Playlist::parse_lossy(SAMPLE, &opts()), a);
    }

    #[test]
    fn indices_are_dense_and_ordered() {
        let pl = Playlist::parse(SAMPLE, &opts()).unwrap();
        for (i, e) in pl.entries().iter().enumerate() {
            assert_eq!(e.index, i);
        }
    }

    #[test]
    fn exclusion_only_tests_the_leading_components() {
        let pl = Playlist::parse("shows/bumpers/x.mp4\nBUMPERS/y.mp4\n", &opts()).unwrap();
        assert!(matches!(pl.get(0).unwrap().kind, EntryKind::Playable { excluded_from_schedule: false, .. }));
        assert!(matches!(pl.get(1).unwrap().kind, EntryKind::Playable { excluded_from_schedule: true, .. }));
    }

    #[test]
    fn malformed_commands_fail_strict_and_are_skipped_lossy() {
        let text = "a.mp4\n%\n%STOP now\nb.mp4\n";
        let err = Playlist::parse(text, &opts()).unwrap_err();
        assert_eq!(err.line, 2);

        let pl = Playlist::parse_lossy(text, &opts());
        assert_eq!(pl.len(), 2);
        assert_eq!(pl.get(1).unwrap().line, 4);
        assert_eq!(pl.get(1).unwrap().index, 1);
    }
}
