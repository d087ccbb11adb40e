//! todo.txt domain library.
//! The core is pure: lines go in, tasks, schedules and views come out. File access lives
//! in `storage` and `settings`, and everything is wired together by `engine`.

pub mod core {
    use chrono::NaiveDate;
    use indexmap::IndexSet;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::{fmt, path::PathBuf, str::FromStr};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Position of a task inside the `TaskStore` arena.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskIndex(pub usize);

    /// Identity of one cooperative batch (a file load or a viewport fill).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BatchId(pub Uuid);

    impl BatchId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for BatchId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Single-letter priority, written `(A)` in a todo line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Priority(char);

    impl Priority {
        pub fn new(letter: char) -> Option<Self> {
            letter.is_ascii_uppercase().then_some(Self(letter))
        }

        pub fn letter(self) -> char {
            self.0
        }
    }

    impl fmt::Display for Priority {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "({})", self.0)
        }
    }

    impl FromStr for Priority {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let mut chars = s.chars();
            match (chars.next(), chars.next(), chars.next(), chars.next()) {
                (Some('('), Some(letter), Some(')'), None) => {
                    Self::new(letter).ok_or_else(|| DomainError::InvalidPriority(s.to_string()))
                }
                _ => Err(DomainError::InvalidPriority(s.to_string())),
            }
        }
    }

    impl Serialize for Priority {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de> Deserialize<'de> for Priority {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let raw = String::deserialize(deserializer)?;
            raw.parse().map_err(serde::de::Error::custom)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum IntervalUnit {
        Days,
        Weeks,
    }

    /// A day-granular interval such as `3d` or `2w`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Interval {
        pub count: u32,
        pub unit: IntervalUnit,
    }

    impl Interval {
        pub fn days(self) -> u64 {
            match self.unit {
                IntervalUnit::Days => u64::from(self.count),
                IntervalUnit::Weeks => u64::from(self.count) * 7,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum RecurrenceKind {
        /// Every n days/weeks counted from the creation date.
        Periodic,
        /// n days/weeks after the last completion.
        SinceCompletion,
        /// Every n months on a fixed day of the month.
        MonthlyDay,
    }

    /// The schedule carried by a recurrence token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum RecurrenceRule {
        Periodic { every: Interval },
        SinceCompletion { every: Interval },
        MonthlyDay { months: u32, day: u32 },
    }

    impl RecurrenceRule {
        pub fn kind(&self) -> RecurrenceKind {
            match self {
                Self::Periodic { .. } => RecurrenceKind::Periodic,
                Self::SinceCompletion { .. } => RecurrenceKind::SinceCompletion,
                Self::MonthlyDay { .. } => RecurrenceKind::MonthlyDay,
            }
        }

        /// Interval count in the rule's own unit (days, weeks or months).
        pub fn interval(&self) -> u32 {
            match self {
                Self::Periodic { every } | Self::SinceCompletion { every } => every.count,
                Self::MonthlyDay { months, .. } => *months,
            }
        }
    }

    /// Result of the last recurrence evaluation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum NextOccurrence {
        On(NaiveDate),
        /// No reference date yet (e.g. never completed).
        Unknown,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Recurrence {
        pub rule: RecurrenceRule,
        /// The token as written, e.g. `rec:2w`.
        pub token: String,
        /// `None` until the recurrence engine has looked at the task.
        pub next: Option<NextOccurrence>,
    }

    impl Recurrence {
        pub fn kind(&self) -> RecurrenceKind {
            self.rule.kind()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SpanKind {
        Plain,
        Context,
        Project,
        Link,
    }

    /// One rendered description word. Consumed extension tokens have no span.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Span {
        pub text: String,
        pub kind: SpanKind,
    }

    /* ------------------------------ Entities ------------------------------ */

    /// One logical todo.txt line.
    ///
    /// A task is never patched in place: any change to the line produces a new `Task`
    /// through `parser::parse_task` (or `lifecycle::rebuild`). The only fields written
    /// after parsing are the schedule-derived ones (`is_deferred`, the effective
    /// `creation_date` of a deferred task and `recurrence.next`).
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Task {
        /// Source of truth; everything else is derived from it.
        pub raw_text: String,

        pub completed: bool,
        pub priority: Option<Priority>,
        pub creation_date: Option<NaiveDate>,
        pub completion_date: Option<NaiveDate>,

        pub due_date: Option<NaiveDate>,
        pub defer_date: Option<NaiveDate>,
        pub is_deferred: bool,
        pub recurrence: Option<Recurrence>,

        pub pinned: bool,
        pub hidden: bool,
        pub tracker_id: Option<String>,
        /// Priority parked in a `pri:X` token while the task is completed.
        pub priority_backup: Option<Priority>,

        /// `@tags` in first-seen order.
        #[serde(default)]
        pub contexts: IndexSet<String>,
        /// `+tags` in first-seen order.
        #[serde(default)]
        pub projects: IndexSet<String>,

        #[serde(default)]
        pub description_spans: Vec<Span>,
    }

    impl Task {
        pub fn first_context(&self) -> Option<&str> {
            self.contexts.first().map(String::as_str)
        }

        pub fn first_project(&self) -> Option<&str> {
            self.projects.first().map(String::as_str)
        }

        pub fn is_recurring(&self) -> bool {
            self.recurrence.is_some()
        }

        /// Rendered description (extension tokens removed).
        pub fn description(&self) -> String {
            self.description_spans
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        }

        /// Words of the raw line, whitespace collapsed.
        pub fn words(&self) -> impl Iterator<Item = &str> {
            self.raw_text.split_whitespace()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("invalid priority {0:?} (expected \"(A)\"..\"(Z)\")")]
        InvalidPriority(String),
    }

    /// Failures at the I/O boundary. The core itself has no failure modes.
    #[derive(Debug, thiserror::Error)]
    pub enum TodoError {
        #[error("todo file {0:?} does not exist")]
        MissingFile(PathBuf),
        #[error("cannot access {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("malformed settings document")]
        Settings(#[from] serde_json::Error),
    }

    pub type Result<T, E = TodoError> = std::result::Result<T, E>;

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn priority_round_trips_through_display() {
            let p: Priority = "(C)".parse().unwrap();
            assert_eq!(p.letter(), 'C');
            assert_eq!(p.to_string(), "(C)");
            assert!("(c)".parse::<Priority>().is_err());
            assert!("(AB)".parse::<Priority>().is_err());
            assert!(Priority::new('a').is_none());
        }

        #[test]
        fn priority_serializes_as_marker() {
            let json = serde_json::to_string(&vec![Priority::new('A').unwrap()]).unwrap();
            assert_eq!(json, r#"["(A)"]"#);
            let back: Vec<Priority> = serde_json::from_str(&json).unwrap();
            assert_eq!(back[0].letter(), 'A');
        }

        #[test]
        fn weeks_expand_to_days() {
            let every = Interval {
                count: 2,
                unit: IntervalUnit::Weeks,
            };
            assert_eq!(every.days(), 14);
        }
    }
}

pub mod classify {
    //! Word classifiers built on `nom`.
    //!
    //! Every predicate looks at a single whitespace-free word. Extension tokens are
    //! dispatched on their prefix (the part before the first `:`), so a word can only
    //! ever match one extension shape.

    use crate::core::*;
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, digit1},
        combinator::{all_consuming, map, map_res, value, verify},
        error::VerboseError,
        sequence::{preceded, tuple},
    };
    use regex::Regex;
    use std::sync::LazyLock;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?:[A-Za-z][A-Za-z0-9+.\-]*://|www\.)\S+$").expect("valid url regex")
    });

    static FILE_PATH_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(?:~|\.{1,2})?/\S+$").expect("valid path regex"));

    /// Inline todo.txt extension tokens.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ExtToken {
        Due(NaiveDate),
        Defer(NaiveDate),
        Recurrence(RecurrenceRule),
        Pin,
        Hide,
        TrackerId(String),
        PriorityBackup(Priority),
    }

    /// What a description word is.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Word {
        Extension(ExtToken),
        Context,
        Project,
        Link,
        Plain,
    }

    /// Classify one description word. Extension shapes win over tag shapes so that
    /// `+rec:2d` is a recurrence and not a project.
    pub fn classify_word(word: &str) -> Word {
        if let Some(ext) = extension(word) {
            Word::Extension(ext)
        } else if is_context(word) {
            Word::Context
        } else if is_project(word) {
            Word::Project
        } else if is_link(word) {
            Word::Link
        } else {
            Word::Plain
        }
    }

    /* ----------------------------- Predicates ----------------------------- */

    pub fn priority(word: &str) -> Option<Priority> {
        word.parse().ok()
    }

    /// `yyyy-mm-dd`, and a real calendar day.
    pub fn iso_date(word: &str) -> Option<NaiveDate> {
        all_consuming(date)(word).ok().map(|(_, d)| d)
    }

    pub fn is_context(word: &str) -> bool {
        word.len() > 1 && word.starts_with('@')
    }

    pub fn is_project(word: &str) -> bool {
        word.len() > 1 && word.starts_with('+')
    }

    pub fn is_link(word: &str) -> bool {
        URL_REGEX.is_match(word) || FILE_PATH_REGEX.is_match(word)
    }

    pub fn extension(word: &str) -> Option<ExtToken> {
        let (prefix, rest) = word.split_once(':')?;
        match prefix {
            "due" => iso_date(rest).map(ExtToken::Due),
            "t" => iso_date(rest).map(ExtToken::Defer),
            "rec" => recurrence(rest).map(ExtToken::Recurrence),
            "+rec" => full(interval, rest).map(|every| {
                ExtToken::Recurrence(RecurrenceRule::SinceCompletion { every })
            }),
            "pin" => (rest == "1").then_some(ExtToken::Pin),
            "h" => (rest == "1").then_some(ExtToken::Hide),
            "tracker-id" => (!rest.is_empty()).then(|| ExtToken::TrackerId(rest.to_string())),
            "pri" => {
                let mut chars = rest.chars();
                match (chars.next(), chars.next()) {
                    (Some(letter), None) => Priority::new(letter).map(ExtToken::PriorityBackup),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /* ------------------------------ Grammar ------------------------------ */

    fn full<'a, T>(parser: impl FnMut(&'a str) -> PResult<'a, T>, input: &'a str) -> Option<T> {
        all_consuming(parser)(input).ok().map(|(_, out)| out)
    }

    /// Body of a `rec:` token: `<dd>d-<n>m`, `<n>m:<dd>d`, `x-<n><d|w>` or `<n><d|w>`.
    fn recurrence(rest: &str) -> Option<RecurrenceRule> {
        full(monthly_day_first, rest)
            .or_else(|| full(monthly_count_first, rest))
            .or_else(|| {
                full(preceded(tag("x-"), interval), rest)
                    .map(|every| RecurrenceRule::SinceCompletion { every })
            })
            .or_else(|| full(interval, rest).map(|every| RecurrenceRule::Periodic { every }))
    }

    fn monthly_day_first(i: &str) -> PResult<'_, RecurrenceRule> {
        map(
            tuple((day_of_month, tag("d-"), count, char('m'))),
            |(day, _, months, _)| RecurrenceRule::MonthlyDay { months, day },
        )(i)
    }

    fn monthly_count_first(i: &str) -> PResult<'_, RecurrenceRule> {
        map(
            tuple((count, tag("m:"), day_of_month, char('d'))),
            |(months, _, day, _)| RecurrenceRule::MonthlyDay { months, day },
        )(i)
    }

    fn interval(i: &str) -> PResult<'_, Interval> {
        map(
            tuple((
                count,
                alt((
                    value(IntervalUnit::Days, char('d')),
                    value(IntervalUnit::Weeks, char('w')),
                )),
            )),
            |(count, unit)| Interval { count, unit },
        )(i)
    }

    fn count(i: &str) -> PResult<'_, u32> {
        verify(map_res(digit1, |s: &str| s.parse::<u32>()), |n: &u32| *n > 0)(i)
    }

    fn day_of_month(i: &str) -> PResult<'_, u32> {
        verify(
            map_res(take_while_m_n(1, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<u32>()
            }),
            |d: &u32| (1..=31).contains(d),
        )(i)
    }

    fn date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

}

pub mod parser {
    //! todo.txt line parser.
    //!
    //! Parsing strategy:
    //! - The header is read positionally: `x [done [created]]`, `(P) [created]` or `created`.
    //! - The description is walked once; tags become spans and extension tokens update the
    //!   task when their guard allows it. Rejected tokens stay in the description as text.

    use crate::classify::{self, ExtToken, Word};
    use crate::core::*;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse one line. Never fails: unknown shapes fall through to plain description.
    pub fn parse_task(line: &str) -> Task {
        let words: Vec<&str> = line.split_whitespace().collect();
        let mut task = Task {
            raw_text: line.to_string(),
            ..Task::default()
        };

        let desc_pos = parse_header(&words, &mut task);

        for &word in &words[desc_pos..] {
            let kind = match classify::classify_word(word) {
                Word::Extension(ext) if !task.hidden => {
                    if apply_extension(&mut task, ext, word) {
                        continue;
                    }
                    SpanKind::Plain
                }
                Word::Context if !task.hidden => {
                    task.contexts.insert(word.to_string());
                    SpanKind::Context
                }
                Word::Project if !task.hidden => {
                    task.projects.insert(word.to_string());
                    SpanKind::Project
                }
                Word::Link => SpanKind::Link,
                _ => SpanKind::Plain,
            };
            task.description_spans.push(Span {
                text: word.to_string(),
                kind,
            });
        }

        task
    }

    /// Parser over whole files, for callers that want to swap implementations.
    pub trait TaskParser {
        fn parse_line(&self, line: &str) -> Task;

        fn parse_lines<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> Vec<Task> {
            lines.into_iter().map(|l| self.parse_line(l)).collect()
        }
    }

    /// The default word-walking parser.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LineParser;

    impl TaskParser for LineParser {
        fn parse_line(&self, line: &str) -> Task {
            parse_task(line)
        }
    }

    /* ------------------------------ Header ------------------------------ */

    /// Returns the index of the first description word.
    fn parse_header(words: &[&str], task: &mut Task) -> usize {
        let date_at = |i: usize| words.get(i).and_then(|w| classify::iso_date(w));

        let Some(&first) = words.first() else {
            return 0;
        };

        if first == "x" {
            task.completed = true;
            let Some(done) = date_at(1) else {
                return 1;
            };
            task.completion_date = Some(done);
            match date_at(2) {
                Some(created) => {
                    task.creation_date = Some(created);
                    3
                }
                None => 2,
            }
        } else if let Some(priority) = classify::priority(first) {
            task.priority = Some(priority);
            match date_at(1) {
                Some(created) => {
                    task.creation_date = Some(created);
                    2
                }
                None => 1,
            }
        } else if let Some(created) = date_at(0) {
            task.creation_date = Some(created);
            1
        } else {
            0
        }
    }

    /* ---------------------------- Extensions ---------------------------- */

    /// Returns false when the token's precondition fails; the word then stays as text.
    fn apply_extension(task: &mut Task, ext: ExtToken, word: &str) -> bool {
        match ext {
            ExtToken::TrackerId(id) => task.tracker_id = Some(id),
            ExtToken::Due(date) => {
                if task.recurrence.is_some() {
                    return false;
                }
                task.due_date = Some(date);
            }
            ExtToken::Defer(date) => {
                if task.recurrence.is_some() {
                    return false;
                }
                task.defer_date = Some(date);
            }
            ExtToken::Recurrence(rule) => {
                if !recurrence_allowed(task, &rule) {
                    return false;
                }
                task.recurrence = Some(Recurrence {
                    rule,
                    token: word.to_string(),
                    next: None,
                });
            }
            ExtToken::Pin => task.pinned = true,
            ExtToken::Hide => hide(task),
            ExtToken::PriorityBackup(priority) => task.priority_backup = Some(priority),
        }
        true
    }

    fn recurrence_allowed(task: &Task, rule: &RecurrenceRule) -> bool {
        if task.due_date.is_some() {
            return false;
        }
        match rule.kind() {
            RecurrenceKind::Periodic | RecurrenceKind::MonthlyDay => task.creation_date.is_some(),
            RecurrenceKind::SinceCompletion => !task.completed || task.completion_date.is_some(),
        }
    }

    /// Hidden tasks keep their header and tracker id, nothing else.
    fn hide(task: &mut Task) {
        task.hidden = true;
        task.contexts.clear();
        task.projects.clear();
        task.due_date = None;
        task.defer_date = None;
        task.recurrence = None;
        task.pinned = false;
        task.priority_backup = None;
        for span in &mut task.description_spans {
            if matches!(span.kind, SpanKind::Context | SpanKind::Project) {
                span.kind = SpanKind::Plain;
            }
        }
    }

}

pub mod format {
    //! Line rewriting. Every mutation is expressed as a new line that is then reparsed.

    use crate::classify::{self, ExtToken};
    use crate::core::*;
    use chrono::NaiveDate;

    /// Canonical form: the raw words joined by single spaces.
    pub fn format_task(task: &Task) -> String {
        task.words().collect::<Vec<_>>().join(" ")
    }

    /// The line of `task` marked done on `today`. A priority moves into a `pri:` token.
    pub fn completed_line(task: &Task, today: NaiveDate) -> String {
        let stamp = today.to_string();
        let backup = task.priority.map(|p| format!("pri:{}", p.letter()));
        let mut out = vec!["x", stamp.as_str()];
        let skip = usize::from(backup.is_some());
        out.extend(task.words().skip(skip));
        out.extend(backup.as_deref());
        out.join(" ")
    }

    /// The line of a completed `task` reopened, restoring a parked priority.
    pub fn reopened_line(task: &Task) -> String {
        let mut words: Vec<&str> = task.words().collect();

        let backup = words.iter().enumerate().find_map(|(i, w)| match classify::extension(w) {
            Some(ExtToken::PriorityBackup(p)) => Some((i, p)),
            _ => None,
        });
        if let Some((i, _)) = backup {
            words.remove(i);
        }

        let header = if words.get(1).is_some_and(|w| classify::iso_date(w).is_some()) {
            2
        } else {
            1
        };
        let rest = &words[header.min(words.len())..];

        let mut out: Vec<String> = Vec::with_capacity(rest.len() + 1);
        if let Some((_, priority)) = backup {
            out.push(priority.to_string());
        }
        out.extend(rest.iter().map(|w| w.to_string()));
        out.join(" ")
    }

    /// Line for the archive log; incomplete tasks are written as completed today.
    pub fn archive_line(task: &Task, today: NaiveDate) -> String {
        if task.completed {
            format_task(task)
        } else {
            completed_line(task, today)
        }
    }

    /// Adds `pin:1`, or removes the first one if the task is pinned.
    pub fn pinned_line(task: &Task) -> String {
        let mut words: Vec<&str> = task.words().collect();
        if task.pinned {
            if let Some(i) = words
                .iter()
                .position(|w| classify::extension(w) == Some(ExtToken::Pin))
            {
                words.remove(i);
            }
        } else {
            words.push("pin:1");
        }
        words.join(" ")
    }

    /// Sets the creation date to `today`, inserting it into the header if absent.
    pub fn stamped_line(task: &Task, today: NaiveDate) -> String {
        let mut words: Vec<String> = task.words().map(str::to_string).collect();
        let idx = if task.completed {
            2
        } else if task.priority.is_some() {
            1
        } else {
            0
        };
        let idx = idx.min(words.len());
        let stamp = today.to_string();
        if words.get(idx).is_some_and(|w| classify::iso_date(w).is_some()) {
            words[idx] = stamp;
        } else {
            words.insert(idx, stamp);
        }
        words.join(" ")
    }

}

pub mod recurrence {
    //! Next-occurrence computation for the three recurrence kinds.
    //!
    //! Creation-anchored rules count from the creation date, the completion-anchored rule
    //! from the completion date. A task never recurs on its own reference day.

    use crate::core::*;
    use crate::{format, lifecycle, parser};
    use chrono::{Datelike, Days, NaiveDate};
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RecurrenceStatus {
        NoRecurrence,
        /// No reference date to count from yet.
        Unknown,
        Scheduled(NaiveDate),
        /// The task recurs today; `next` is the occurrence after today.
        FiresToday { next: NaiveDate },
    }

    pub fn evaluate(task: &Task, today: NaiveDate) -> RecurrenceStatus {
        let Some(recurrence) = &task.recurrence else {
            return RecurrenceStatus::NoRecurrence;
        };
        let status = match recurrence.rule {
            RecurrenceRule::Periodic { every } => task
                .creation_date
                .and_then(|reference| advance_days(reference, every.days(), today)),
            RecurrenceRule::SinceCompletion { every } => task
                .completion_date
                .and_then(|reference| advance_days(reference, every.days(), today)),
            RecurrenceRule::MonthlyDay { months, day } => task
                .creation_date
                .and_then(|reference| advance_months(reference, months, day, today)),
        };
        status.unwrap_or(RecurrenceStatus::Unknown)
    }

    /// Recompute the recurrence of `task`. When it fires, `task` is replaced by the
    /// rebuilt line (creation date moved to today, reopened if it was done) and `true`
    /// is returned.
    pub fn check_recurrence(task: &mut Task, today: NaiveDate) -> bool {
        match evaluate(task, today) {
            RecurrenceStatus::NoRecurrence => false,
            RecurrenceStatus::FiresToday { next } => {
                if let Some(recurrence) = &task.recurrence {
                    debug!(token = %recurrence.token, %next, "recurrence fired");
                }
                *task = fire(task, today);
                true
            }
            RecurrenceStatus::Scheduled(next) => {
                record(task, NextOccurrence::On(next));
                false
            }
            RecurrenceStatus::Unknown => {
                record(task, NextOccurrence::Unknown);
                false
            }
        }
    }

    fn record(task: &mut Task, next: NextOccurrence) {
        if let Some(recurrence) = task.recurrence.as_mut() {
            recurrence.next = Some(next);
        }
    }

    fn fire(task: &Task, today: NaiveDate) -> Task {
        let line = format::stamped_line(task, today);
        if task.completed {
            lifecycle::toggle_task(&parser::parse_task(&line), today)
        } else {
            lifecycle::rebuild(&line, today)
        }
    }

    fn settle(reference: NaiveDate, candidate: NaiveDate, today: NaiveDate) -> (bool, bool) {
        let fires = candidate == today && reference != today;
        (fires, fires || candidate == reference)
    }

    fn advance_days(reference: NaiveDate, step: u64, today: NaiveDate) -> Option<RecurrenceStatus> {
        if step == 0 {
            return None;
        }
        let mut candidate = reference;
        if candidate < today {
            let behind = u64::try_from((today - candidate).num_days()).ok()?;
            let jumps = behind.div_ceil(step);
            candidate = candidate.checked_add_days(Days::new(jumps.checked_mul(step)?))?;
        }

        let (fires, bump) = settle(reference, candidate, today);
        if bump {
            candidate = candidate.checked_add_days(Days::new(step))?;
        }
        Some(if fires {
            RecurrenceStatus::FiresToday { next: candidate }
        } else {
            RecurrenceStatus::Scheduled(candidate)
        })
    }

    fn advance_months(
        reference: NaiveDate,
        months: u32,
        day: u32,
        today: NaiveDate,
    ) -> Option<RecurrenceStatus> {
        if months == 0 {
            return None;
        }
        let step = i64::from(months);
        let target = (i64::from(today.year()), today.month(), today.day());
        let mut month_index = i64::from(reference.year()) * 12 + i64::from(reference.month0());
        let mut day = day;

        // Candidates may name days that do not exist (Feb 30); they still order correctly.
        while (month_index.div_euclid(12), month_index.rem_euclid(12) as u32 + 1, day) < target {
            month_index += step;
        }
        let mut candidate = clamp(month_index, &mut day)?;

        let (fires, bump) = settle(reference, candidate, today);
        if bump {
            month_index += step;
            candidate = clamp(month_index, &mut day)?;
        }
        Some(if fires {
            RecurrenceStatus::FiresToday { next: candidate }
        } else {
            RecurrenceStatus::Scheduled(candidate)
        })
    }

    /// Walks `day` down until it names a real date in that month. The lowered day is kept
    /// for later advances.
    fn clamp(month_index: i64, day: &mut u32) -> Option<NaiveDate> {
        let year = i32::try_from(month_index.div_euclid(12)).ok()?;
        let month = u32::try_from(month_index.rem_euclid(12)).ok()? + 1;
        while *day > 0 {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, *day) {
                return Some(date);
            }
            *day -= 1;
        }
        None
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_task;
        use proptest::prelude::*;

        fn d(s: &str) -> NaiveDate {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
        }

        #[test]
        fn periodic_fires_on_interval_boundaries() {
            let t = parse_task("2024-01-01 Water plants rec:3d");
            assert_eq!(
                evaluate(&t, d("2024-01-07")),
                RecurrenceStatus::FiresToday {
                    next: d("2024-01-10")
                }
            );
            assert_eq!(
                evaluate(&t, d("2024-01-08")),
                RecurrenceStatus::Scheduled(d("2024-01-10"))
            );
        }

        #[test]
        fn never_fires_on_creation_day() {
            let t = parse_task("2024-01-01 Water plants rec:3d");
            assert_eq!(
                evaluate(&t, d("2024-01-01")),
                RecurrenceStatus::Scheduled(d("2024-01-04"))
            );
        }

        #[test]
        fn future_creation_date_is_skipped() {
            let t = parse_task("2024-03-01 Later rec:1w");
            assert_eq!(
                evaluate(&t, d("2024-02-01")),
                RecurrenceStatus::Scheduled(d("2024-03-08"))
            );
        }

        #[test]
        fn completed_task_with_periodic_rule_counts_from_creation() {
            let t = parse_task("x 2024-02-01 2024-01-15 Finish report rec:1w");
            assert_eq!(
                evaluate(&t, d("2024-02-10")),
                RecurrenceStatus::Scheduled(d("2024-02-12"))
            );
        }

        #[test]
        fn since_completion_counts_from_completion() {
            let t = parse_task("x 2024-02-01 2024-01-15 Finish report +rec:1w");
            assert_eq!(
                evaluate(&t, d("2024-02-05")),
                RecurrenceStatus::Scheduled(d("2024-02-08"))
            );
            assert_eq!(
                evaluate(&t, d("2024-02-08")),
                RecurrenceStatus::FiresToday {
                    next: d("2024-02-15")
                }
            );
        }

        #[test]
        fn since_completion_without_completion_is_unknown() {
            let t = parse_task("Finish report +rec:1w");
            assert_eq!(evaluate(&t, d("2024-02-05")), RecurrenceStatus::Unknown);
        }

        #[test]
        fn monthly_day_clamps_and_keeps_the_lowered_day() {
            let t = parse_task("2024-01-10 Pay rent rec:1m:31d");
            assert_eq!(
                evaluate(&t, d("2024-02-15")),
                RecurrenceStatus::Scheduled(d("2024-02-29"))
            );
            assert_eq!(
                evaluate(&t, d("2024-02-29")),
                RecurrenceStatus::FiresToday {
                    next: d("2024-03-29")
                }
            );
        }

        #[test]
        fn monthly_day_multi_month_step() {
            let t = parse_task("2024-01-20 Review budget rec:5d-3m");
            assert_eq!(
                evaluate(&t, d("2024-02-01")),
                RecurrenceStatus::Scheduled(d("2024-04-05"))
            );
        }

        #[test]
        fn firing_moves_creation_date_and_reopens() {
            let mut t = parse_task("x 2024-01-05 2024-01-01 Water plants rec:1w pri:A");
            assert!(check_recurrence(&mut t, d("2024-01-08")));
            assert_eq!(t.raw_text, "(A) 2024-01-08 Water plants rec:1w");
            assert!(!t.completed);
            assert_eq!(t.creation_date, Some(d("2024-01-08")));
            assert_eq!(
                t.recurrence.as_ref().and_then(|r| r.next),
                Some(NextOccurrence::On(d("2024-01-15")))
            );
        }

        #[test]
        fn firing_open_task_only_moves_creation_date() {
            let mut t = parse_task("2024-01-01 Water plants @garden rec:2d");
            assert!(check_recurrence(&mut t, d("2024-01-05")));
            assert_eq!(t.raw_text, "2024-01-05 Water plants @garden rec:2d");
            assert!(!check_recurrence(&mut t, d("2024-01-05")));
        }

        #[test]
        fn since_completion_fires_then_waits_for_next_completion() {
            let mut t = parse_task("x 2024-02-01 Stretch +rec:2d");
            assert!(check_recurrence(&mut t, d("2024-02-03")));
            assert_eq!(t.raw_text, "2024-02-03 Stretch +rec:2d");
            assert_eq!(
                t.recurrence.as_ref().and_then(|r| r.next),
                Some(NextOccurrence::Unknown)
            );
        }

        #[test]
        fn oversized_intervals_do_not_panic() {
            let t = parse_task("2024-01-01 Far rec:4294967295w");
            assert!(matches!(
                evaluate(&t, d("2024-06-01")),
                RecurrenceStatus::Unknown | RecurrenceStatus::Scheduled(_)
            ));
        }

        fn creation() -> impl Strategy<Value = NaiveDate> {
            (0i64..20_000).prop_map(|offset| d("1990-01-01") + chrono::Duration::days(offset))
        }

        proptest! {
            #[test]
            fn creation_anchored_rules_never_fire_on_creation_day(
                created in creation(),
                n in 1u32..40,
                day in 1u32..=31,
                weekly in any::<bool>(),
            ) {
                let unit = if weekly { "w" } else { "d" };
                for token in [format!("rec:{n}{unit}"), format!("rec:{n}m:{day}d")] {
                    let t = parse_task(&format!("{created} Chore {token}"));
                    prop_assert!(t.recurrence.is_some());
                    let status = evaluate(&t, created);
                    let fired = matches!(status, RecurrenceStatus::FiresToday { .. });
                    prop_assert!(!fired);
                }
            }

            #[test]
            fn since_completion_is_unknown_without_completion_date(
                today in creation(),
                n in 1u32..40,
            ) {
                let t = parse_task(&format!("Chore +rec:{n}d"));
                prop_assert_eq!(evaluate(&t, today), RecurrenceStatus::Unknown);
            }

            #[test]
            fn since_completion_is_deterministic_with_completion_date(
                done in creation(),
                today in creation(),
                n in 1u32..40,
            ) {
                let t = parse_task(&format!("x {done} Chore +rec:{n}d"));
                let first = evaluate(&t, today);
                prop_assert_eq!(first, evaluate(&t, today));
                let known = matches!(
                    first,
                    RecurrenceStatus::Scheduled(_) | RecurrenceStatus::FiresToday { .. }
                );
                prop_assert!(known);
            }
        }
    }
}

pub mod deferral {
    use crate::core::Task;
    use chrono::NaiveDate;

    /// Updates the deferral state of `task`. A task with a defer date counts as created on
    /// that date. Returns `true` exactly once, when a deferred task becomes active.
    pub fn check_deferral(task: &mut Task, today: NaiveDate) -> bool {
        let Some(defer) = task.defer_date else {
            return false;
        };
        task.creation_date = Some(defer);
        if defer > today {
            task.is_deferred = true;
            return false;
        }
        std::mem::replace(&mut task.is_deferred, false)
    }

}

pub mod lifecycle {
    //! Rebuild-on-write mutations. Each returns a fresh task; the old one is discarded.

    use crate::core::Task;
    use crate::{deferral, format, parser, recurrence};
    use chrono::NaiveDate;

    /// What a schedule refresh changed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Refresh {
        pub recurred: bool,
        pub opened: bool,
    }

    /// Run the recurrence engine, then the deferral tracker.
    pub fn refresh(task: &mut Task, today: NaiveDate) -> Refresh {
        let recurred = recurrence::check_recurrence(task, today);
        let opened = deferral::check_deferral(task, today);
        Refresh { recurred, opened }
    }

    /// Parse `line` and bring its schedule up to date.
    pub fn rebuild(line: &str, today: NaiveDate) -> Task {
        let mut task = parser::parse_task(line);
        refresh(&mut task, today);
        task
    }

    pub fn toggle_task(task: &Task, today: NaiveDate) -> Task {
        let line = if task.completed {
            format::reopened_line(task)
        } else {
            format::completed_line(task, today)
        };
        rebuild(&line, today)
    }

    pub fn toggle_pin(task: &Task, today: NaiveDate) -> Task {
        rebuild(&format::pinned_line(task), today)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_task;

        fn d(s: &str) -> NaiveDate {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
        }

        #[test]
        fn toggle_round_trip() {
            let today = d("2024-05-05");
            let open = parse_task("(B) 2024-05-01 Write tests @desk");
            let done = toggle_task(&open, today);
            assert!(done.completed);
            assert_eq!(done.completion_date, Some(today));
            assert!(done.priority.is_none());
            assert_eq!(done.priority_backup.map(|p| p.letter()), Some('B'));

            let again = toggle_task(&done, today);
            assert_eq!(again.raw_text, "(B) 2024-05-01 Write tests @desk");
            assert_eq!(again.priority.map(|p| p.letter()), Some('B'));
        }

        #[test]
        fn rebuild_applies_schedule() {
            let t = rebuild("Later t:2099-01-01", d("2024-05-05"));
            assert!(t.is_deferred);
            let t = rebuild("2024-05-01 Chore rec:2d", d("2024-05-02"));
            assert!(t.recurrence.as_ref().is_some_and(|r| r.next.is_some()));
        }

        #[test]
        fn pin_round_trip() {
            let today = d("2024-05-05");
            let t = toggle_pin(&parse_task("Call bank"), today);
            assert!(t.pinned);
            let t = toggle_pin(&t, today);
            assert!(!t.pinned);
            assert_eq!(t.raw_text, "Call bank");
        }
    }
}

pub mod filter {
    //! Viewport membership predicate.
    //!
    //! Categories combine with OR ("match any"), and the inversion flag flips the result
    //! of that match. Pinned, hidden, deferred and recurring tasks are decided before
    //! any category is consulted.

    use crate::classify;
    use crate::core::*;
    use crate::fuzzy;
    use crate::store::TaskStats;
    use indexmap::IndexSet;
    use serde::{Deserialize, Serialize};
    use std::hash::Hash;

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct FilterConfig {
        pub invert: bool,
        #[serde(rename = "defer")]
        pub include_deferred: bool,
        #[serde(rename = "recurring")]
        pub include_recurring: bool,
        #[serde(rename = "hidden")]
        pub include_hidden: bool,
        #[serde(rename = "completed")]
        pub include_completed: bool,
        #[serde(rename = "no_priority")]
        pub include_no_priority: bool,
        pub priorities: IndexSet<Priority>,
        pub contexts: IndexSet<String>,
        pub projects: IndexSet<String>,
        /// Saved custom terms, active or not.
        pub custom: IndexSet<String>,
        /// Custom terms currently applied; fuzzy-matched against the raw line.
        #[serde(rename = "custom_active")]
        pub custom_terms: IndexSet<String>,
    }

    /// Which set a toggled keyword landed in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FilterCategory {
        Priority,
        Context,
        Project,
        Custom,
    }

    impl FilterConfig {
        pub fn passes(&self, task: &Task) -> bool {
            if task.pinned {
                return true;
            }
            if self.include_hidden {
                return task.hidden;
            }
            if task.hidden {
                return false;
            }
            if self.include_deferred {
                return task.is_deferred;
            }
            if self.include_recurring {
                return task.is_recurring();
            }
            if task.is_recurring() && task.completed {
                return false;
            }
            if task.is_deferred {
                return false;
            }
            if !self.has_active_filters() {
                return true;
            }

            if self.matches_any(task) {
                !self.invert
            } else {
                self.invert
            }
        }

        fn matches_any(&self, task: &Task) -> bool {
            let status = if task.completed {
                self.include_completed
            } else {
                task.priority.is_none() && self.include_no_priority
            };

            status
                || task.priority.is_some_and(|p| self.priorities.contains(&p))
                || task.contexts.iter().any(|c| self.contexts.contains(c))
                || task.projects.iter().any(|p| self.projects.contains(p))
                || self
                    .custom_terms
                    .iter()
                    .any(|term| fuzzy::score(term, &task.raw_text).is_some())
        }

        pub fn has_active_filters(&self) -> bool {
            self.include_deferred
                || self.include_recurring
                || self.include_hidden
                || self.include_completed
                || self.include_no_priority
                || !self.priorities.is_empty()
                || !self.contexts.is_empty()
                || !self.projects.is_empty()
                || !self.custom_terms.is_empty()
        }

        /// Flip membership of `keyword` in the set its shape selects. Anything that is not
        /// a priority, context or project is treated as a custom term (and saved).
        /// Returns the category and whether the keyword is now active.
        pub fn toggle_filter(&mut self, keyword: &str) -> (FilterCategory, bool) {
            if let Some(priority) = classify::priority(keyword) {
                (FilterCategory::Priority, flip(&mut self.priorities, priority))
            } else if classify::is_context(keyword) {
                (FilterCategory::Context, flip(&mut self.contexts, keyword.to_string()))
            } else if classify::is_project(keyword) {
                (FilterCategory::Project, flip(&mut self.projects, keyword.to_string()))
            } else {
                self.custom.insert(keyword.to_string());
                (FilterCategory::Custom, flip(&mut self.custom_terms, keyword.to_string()))
            }
        }

        pub fn toggle_invert(&mut self) -> bool {
            self.invert = !self.invert;
            self.invert
        }

        /// Drop priority/context/project filters that no task carries any more.
        pub fn prune_stale(&mut self, stats: &TaskStats) {
            self.priorities.retain(|p| stats.priorities.contains_key(p));
            self.contexts.retain(|c| stats.contexts.contains_key(c));
            self.projects.retain(|p| stats.projects.contains_key(p));
        }
    }

    fn flip<T: Hash + Eq>(set: &mut IndexSet<T>, item: T) -> bool {
        if set.shift_remove(&item) {
            false
        } else {
            set.insert(item);
            true
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::lifecycle::rebuild;
        use chrono::NaiveDate;

        fn today() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
        }

        fn task(line: &str) -> Task {
            rebuild(line, today())
        }

        fn with_priority(letter: char) -> FilterConfig {
            let mut cfg = FilterConfig::default();
            cfg.priorities.insert(Priority::new(letter).unwrap());
            cfg
        }

        #[test]
        fn priority_filter_selects_matching_tasks() {
            let cfg = with_priority('A');
            assert!(cfg.passes(&task("(A) First")));
            assert!(!cfg.passes(&task("(B) Second")));
        }

        #[test]
        fn inversion_flips_category_matches() {
            let mut cfg = with_priority('A');
            cfg.invert = true;
            assert!(!cfg.passes(&task("(A) First")));
            assert!(cfg.passes(&task("(B) Second")));
        }

        #[test]
        fn categories_combine_with_or() {
            let mut cfg = with_priority('A');
            cfg.contexts.insert("@home".into());
            assert!(cfg.passes(&task("(B) Sweep @home")));
            assert!(cfg.passes(&task("(A) Call @work")));
            assert!(!cfg.passes(&task("(C) Call @work")));
        }

        #[test]
        fn no_filters_pass_everything_visible() {
            let cfg = FilterConfig::default();
            assert!(cfg.passes(&task("Plain")));
            assert!(cfg.passes(&task("x 2024-05-01 Done")));
            assert!(!cfg.passes(&task("Secret h:1")));
            assert!(!cfg.passes(&task("Later t:2099-01-01")));
            assert!(!cfg.passes(&task("x 2024-05-31 2024-05-01 Chore rec:1w")));
            assert!(cfg.passes(&task("2024-05-01 Chore rec:1w")));
        }

        #[test]
        fn pinned_always_passes() {
            let mut cfg = with_priority('A');
            cfg.include_hidden = true;
            assert!(cfg.passes(&task("(Z) Important pin:1")));
        }

        #[test]
        fn exclusive_filters_decide_outright() {
            let mut cfg = FilterConfig {
                include_hidden: true,
                ..FilterConfig::default()
            };
            assert!(cfg.passes(&task("Secret h:1")));
            assert!(!cfg.passes(&task("Plain")));

            cfg.include_hidden = false;
            cfg.include_deferred = true;
            assert!(cfg.passes(&task("Later t:2099-01-01")));
            assert!(!cfg.passes(&task("Plain")));

            cfg.include_deferred = false;
            cfg.include_recurring = true;
            assert!(cfg.passes(&task("x 2024-05-31 2024-05-01 Chore rec:1w")));
            assert!(!cfg.passes(&task("Plain")));
        }

        #[test]
        fn completed_and_no_priority_categories() {
            let cfg = FilterConfig {
                include_completed: true,
                ..FilterConfig::default()
            };
            assert!(cfg.passes(&task("x 2024-05-01 Done")));
            assert!(!cfg.passes(&task("Open")));

            let cfg = FilterConfig {
                include_no_priority: true,
                ..FilterConfig::default()
            };
            assert!(cfg.passes(&task("Open")));
            assert!(!cfg.passes(&task("(A) Urgent")));
            assert!(!cfg.passes(&task("x 2024-05-01 Done")));
        }

        #[test]
        fn custom_terms_fuzzy_match_raw_text() {
            let mut cfg = FilterConfig::default();
            cfg.toggle_filter("grcs");
            assert!(cfg.passes(&task("Buy groceries")));
            assert!(!cfg.passes(&task("Walk dog")));
        }

        #[test]
        fn toggling_flips_membership() {
            let mut cfg = FilterConfig::default();
            assert_eq!(cfg.toggle_filter("(B)"), (FilterCategory::Priority, true));
            assert_eq!(cfg.toggle_filter("@home"), (FilterCategory::Context, true));
            assert_eq!(cfg.toggle_filter("+garden"), (FilterCategory::Project, true));
            assert!(cfg.has_active_filters());
            assert_eq!(cfg.toggle_filter("(B)"), (FilterCategory::Priority, false));
            assert_eq!(cfg.toggle_filter("bread"), (FilterCategory::Custom, true));
            assert_eq!(cfg.toggle_filter("bread"), (FilterCategory::Custom, false));
            assert!(cfg.custom.contains("bread"));
            assert!(cfg.toggle_invert());
        }

        #[test]
        fn stale_filters_are_pruned() {
            let mut cfg = FilterConfig::default();
            cfg.toggle_filter("(A)");
            cfg.toggle_filter("(B)");
            cfg.toggle_filter("@home");
            cfg.toggle_filter("+gone");
            let tasks = [task("(A) Sweep @home")];
            cfg.prune_stale(&TaskStats::collect(&tasks));
            assert_eq!(cfg.priorities.len(), 1);
            assert!(cfg.contexts.contains("@home"));
            assert!(cfg.projects.is_empty());
        }

        #[test]
        fn persisted_field_names() {
            let mut cfg = with_priority('A');
            cfg.include_deferred = true;
            let json = serde_json::to_value(&cfg).unwrap();
            assert_eq!(json["defer"], true);
            assert_eq!(json["priorities"][0], "(A)");
            assert!(json.get("custom_active").is_some());
            let back: FilterConfig = serde_json::from_value(json).unwrap();
            assert_eq!(back, cfg);
        }
    }
}

pub mod sort {
    //! Stable multi-key ordering.

    use crate::core::*;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::cmp::Ordering;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum SortKey {
        Pin,
        Completed,
        Priority,
        DueDate,
        Recurrence,
        Context,
        Project,
        CreationDate,
        CompletionDate,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum SortOrder {
        #[serde(rename = "asc")]
        Ascending,
        #[serde(rename = "desc")]
        Descending,
    }

    impl SortOrder {
        fn apply(self, ord: Ordering) -> Ordering {
            match self {
                Self::Ascending => ord,
                Self::Descending => ord.reverse(),
            }
        }
    }

    /// User-ordered list of sort keys; earlier keys win.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SortSpec(pub Vec<(SortKey, SortOrder)>);

    impl Default for SortSpec {
        fn default() -> Self {
            use SortKey::*;
            use SortOrder::*;
            Self(vec![
                (Pin, Descending),
                (Completed, Ascending),
                (Priority, Ascending),
                (DueDate, Ascending),
                (Recurrence, Ascending),
                (Context, Ascending),
                (Project, Ascending),
                (CreationDate, Ascending),
                (CompletionDate, Ascending),
            ])
        }
    }

    pub fn compare(a: &Task, b: &Task, spec: &SortSpec) -> Ordering {
        spec.0
            .iter()
            .map(|&(key, order)| compare_key(a, b, key, order))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Sort `indices` into `tasks` in place. Equal tasks keep their relative order.
    pub fn sort_indices(tasks: &[Task], indices: &mut [TaskIndex], spec: &SortSpec) {
        indices.sort_by(|a, b| match (tasks.get(a.0), tasks.get(b.0)) {
            (Some(x), Some(y)) => compare(x, y, spec),
            _ => Ordering::Equal,
        });
    }

    fn compare_key(a: &Task, b: &Task, key: SortKey, order: SortOrder) -> Ordering {
        match key {
            SortKey::Pin => order.apply(a.pinned.cmp(&b.pinned)),
            SortKey::Completed => order.apply(a.completed.cmp(&b.completed)),
            // "No priority" stays last in both directions.
            SortKey::Priority => match (a.priority, b.priority) {
                (Some(x), Some(y)) => order.apply(x.cmp(&y)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            SortKey::DueDate => order.apply(no_due_date_latest(a.due_date, b.due_date)),
            SortKey::Recurrence => order.apply(recurrence_rank(a).cmp(&recurrence_rank(b))),
            // `None` orders below `Some`: a missing tag or date is the lowest value.
            SortKey::Context => order.apply(a.first_context().cmp(&b.first_context())),
            SortKey::Project => order.apply(a.first_project().cmp(&b.first_project())),
            SortKey::CreationDate => order.apply(a.creation_date.cmp(&b.creation_date)),
            SortKey::CompletionDate => order.apply(a.completion_date.cmp(&b.completion_date)),
        }
    }

    /// A task without a due date is due after every dated one.
    fn no_due_date_latest(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
        match (a, b) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    /// Real dates, then unknown, then non-recurring (or not yet evaluated).
    fn recurrence_rank(task: &Task) -> (u8, Option<NaiveDate>) {
        match task.recurrence.as_ref().and_then(|r| r.next) {
            Some(NextOccurrence::On(date)) => (0, Some(date)),
            Some(NextOccurrence::Unknown) => (1, None),
            None => (2, None),
        }
    }

}

pub mod fuzzy {
    //! Subsequence matcher used by search and custom filter terms.

    const MATCH: i64 = 1;
    const CONSECUTIVE: i64 = 5;
    const WORD_START: i64 = 3;

    /// Case-insensitive subsequence score; `None` when some pattern char is missing.
    ///
    /// Higher is better: consecutive runs and matches at word starts score extra, and
    /// each skipped char between matches costs one point.
    pub fn score(pattern: &str, text: &str) -> Option<i64> {
        let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
        if pattern.is_empty() {
            return Some(0);
        }

        let mut score = 0;
        let mut next = 0;
        let mut last_match: Option<usize> = None;
        let mut prev: Option<char> = None;

        for (i, c) in text.chars().flat_map(char::to_lowercase).enumerate() {
            if c == pattern[next] {
                score += MATCH;
                match last_match {
                    Some(j) if j + 1 == i => score += CONSECUTIVE,
                    Some(j) => score -= i64::try_from(i - j - 1).unwrap_or(i64::MAX),
                    None => {}
                }
                if prev.is_none_or(|p| !p.is_alphanumeric()) {
                    score += WORD_START;
                }
                last_match = Some(i);
                next += 1;
                if next == pattern.len() {
                    return Some(score);
                }
            }
            prev = Some(c);
        }
        None
    }

}

pub mod search {
    //! Incremental fuzzy search with prefix reuse.
    //!
    //! Each normalised query's result list is cached for the lifetime of the session. A
    //! query extending a cached one only rescans that cached (smaller) list, since a
    //! subsequence match for the longer query implies one for its prefix.

    use crate::core::*;
    use crate::fuzzy;
    use indexmap::IndexMap;
    use tracing::debug;

    /// Where a result list came from.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SearchSource {
        /// Empty query: the base list unchanged.
        Empty,
        CacheHit,
        /// Rescored from the cached results of a shorter query.
        Narrowed { from: String },
        FullScan,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SearchOutcome {
        pub query: String,
        pub results: Vec<TaskIndex>,
        pub source: SearchSource,
    }

    #[derive(Debug, Default)]
    pub struct SearchSession {
        cache: IndexMap<String, Vec<TaskIndex>>,
    }

    pub fn normalize(query: &str) -> String {
        query.trim().to_lowercase()
    }

    impl SearchSession {
        pub fn new() -> Self {
            Self::default()
        }

        /// Search `base` (indices into `tasks`) for `query`.
        pub fn search(&mut self, tasks: &[Task], base: &[TaskIndex], query: &str) -> SearchOutcome {
            let query = normalize(query);
            if query.is_empty() {
                return SearchOutcome {
                    query,
                    results: base.to_vec(),
                    source: SearchSource::Empty,
                };
            }

            if let Some(hit) = self.cache.get(&query) {
                debug!(%query, results = hit.len(), "search cache hit");
                return SearchOutcome {
                    results: hit.clone(),
                    query,
                    source: SearchSource::CacheHit,
                };
            }

            let prefix = self
                .cache
                .keys()
                .filter(|k| query.starts_with(k.as_str()))
                .max_by_key(|k| k.len())
                .cloned();

            let (space, source) = match prefix {
                Some(from) => {
                    let space = self.cache.get(&from).cloned().unwrap_or_default();
                    (space, SearchSource::Narrowed { from })
                }
                None => (base.to_vec(), SearchSource::FullScan),
            };
            debug!(%query, candidates = space.len(), ?source, "search rescoring");

            let mut scored: Vec<(i64, TaskIndex)> = space
                .into_iter()
                .filter_map(|idx| {
                    let task = tasks.get(idx.0)?;
                    fuzzy::score(&query, &task.raw_text).map(|s| (s, idx))
                })
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0));

            let results: Vec<TaskIndex> = scored.into_iter().map(|(_, idx)| idx).collect();
            self.cache.insert(query.clone(), results.clone());

            SearchOutcome {
                query,
                results,
                source,
            }
        }

        pub fn cached_queries(&self) -> impl Iterator<Item = &str> {
            self.cache.keys().map(String::as_str)
        }

        pub fn clear(&mut self) {
            self.cache.clear();
        }
    }

}

pub mod store {
    //! Ordered owner of every task, plus derived statistics and the daily date check.

    use crate::core::*;
    use crate::parser::{LineParser, TaskParser};
    use crate::{format, lifecycle};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use serde::Serialize;
    use tracing::info;

    /* ------------------------------ Statistics ------------------------------ */

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct TaskStats {
        pub total: usize,
        pub deferred: usize,
        pub recurring_completed: usize,
        pub recurring_open: usize,
        pub hidden: usize,
        pub completed: usize,
        pub no_priority: usize,
        pub priorities: IndexMap<Priority, usize>,
        pub contexts: IndexMap<String, usize>,
        pub projects: IndexMap<String, usize>,
    }

    impl TaskStats {
        /// Deferred tasks count only as deferred and completed tasks only as
        /// (recurring-)completed. Hidden tasks still contribute their tags.
        pub fn collect<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
            let mut stats = Self::default();
            for task in tasks {
                stats.total += 1;
                if task.is_deferred {
                    stats.deferred += 1;
                    continue;
                }
                if task.completed {
                    if task.is_recurring() {
                        stats.recurring_completed += 1;
                    } else {
                        stats.completed += 1;
                    }
                    continue;
                }
                for project in &task.projects {
                    *stats.projects.entry(project.clone()).or_default() += 1;
                }
                for context in &task.contexts {
                    *stats.contexts.entry(context.clone()).or_default() += 1;
                }
                if task.hidden {
                    stats.hidden += 1;
                    continue;
                }
                match task.priority {
                    Some(priority) => *stats.priorities.entry(priority).or_default() += 1,
                    None => stats.no_priority += 1,
                }
                if task.is_recurring() {
                    stats.recurring_open += 1;
                }
            }
            stats
        }

        /// Tasks still to do today.
        pub fn open_count(&self) -> usize {
            self.total.saturating_sub(
                self.completed + self.hidden + self.recurring_completed + self.deferred,
            )
        }
    }

    /* ------------------------------ Date check ------------------------------ */

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    pub struct DateCheckReport {
        pub recurred: usize,
        pub opened: usize,
    }

    impl DateCheckReport {
        /// True when at least one task changed and the file needs rewriting.
        pub fn changed(&self) -> bool {
            self.recurred > 0 || self.opened > 0
        }

        pub fn messages(&self) -> Vec<String> {
            let mut out = Vec::new();
            match self.recurred {
                0 => {}
                1 => out.push("1 task has recurred".to_string()),
                n => out.push(format!("{n} tasks have recurred")),
            }
            match self.opened {
                0 => {}
                1 => out.push("1 deferred task has been opened".to_string()),
                n => out.push(format!("{n} deferred tasks have been opened")),
            }
            out
        }

        pub fn notify(&self, notifier: &dyn Notifier) {
            for message in self.messages() {
                notifier.notify(&message);
            }
        }
    }

    /// User-visible notification sink.
    pub trait Notifier {
        fn notify(&self, message: &str);
    }

    /// Sends notifications to the log.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LogNotifier;

    impl Notifier for LogNotifier {
        fn notify(&self, message: &str) {
            info!(target: "todotxt::notify", "{message}");
        }
    }

    /* -------------------------------- Store -------------------------------- */

    /// Tasks in file order. A `TaskIndex` is a position, so indices held by derived
    /// views are only valid until the next structural change.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TaskStore {
        tasks: Vec<Task>,
    }

    impl TaskStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_tasks(tasks: Vec<Task>) -> Self {
            Self { tasks }
        }

        /// Parse only; run `check_dates` afterwards to evaluate schedules.
        pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
            Self::from_tasks(LineParser.parse_lines(lines))
        }

        pub fn len(&self) -> usize {
            self.tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.tasks.is_empty()
        }

        pub fn tasks(&self) -> &[Task] {
            &self.tasks
        }

        pub fn get(&self, idx: TaskIndex) -> Option<&Task> {
            self.tasks.get(idx.0)
        }

        pub fn iter(&self) -> impl Iterator<Item = (TaskIndex, &Task)> {
            self.tasks.iter().enumerate().map(|(i, t)| (TaskIndex(i), t))
        }

        pub fn indices(&self) -> impl Iterator<Item = TaskIndex> + use<> {
            (0..self.tasks.len()).map(TaskIndex)
        }

        pub fn push(&mut self, task: Task) -> TaskIndex {
            self.tasks.push(task);
            TaskIndex(self.tasks.len() - 1)
        }

        /// Swap in a rebuilt task, returning the old one.
        pub fn replace(&mut self, idx: TaskIndex, task: Task) -> Option<Task> {
            let slot = self.tasks.get_mut(idx.0)?;
            Some(std::mem::replace(slot, task))
        }

        pub fn remove(&mut self, idx: TaskIndex) -> Option<Task> {
            (idx.0 < self.tasks.len()).then(|| self.tasks.remove(idx.0))
        }

        pub fn to_lines(&self) -> Vec<String> {
            self.tasks.iter().map(format::format_task).collect()
        }

        pub fn stats(&self) -> TaskStats {
            TaskStats::collect(&self.tasks)
        }

        /// Recurrence then deferral for every task.
        pub fn check_dates(&mut self, today: NaiveDate) -> DateCheckReport {
            let mut report = DateCheckReport::default();
            for task in &mut self.tasks {
                let refresh = lifecycle::refresh(task, today);
                report.recurred += usize::from(refresh.recurred);
                report.opened += usize::from(refresh.opened);
            }
            if report.changed() {
                info!(%today, recurred = report.recurred, opened = report.opened, "date check");
            }
            report
        }

        /// Remove completed tasks that are neither recurring nor hidden, returning their
        /// archive lines.
        pub fn take_archivable(&mut self, today: NaiveDate) -> Vec<String> {
            let lines = self
                .tasks
                .iter()
                .filter(|t| clearable(t))
                .map(|t| format::archive_line(t, today))
                .collect();
            self.tasks.retain(|t| !clearable(t));
            lines
        }

        /// Same selection as `take_archivable`. Returns how many were dropped.
        pub fn delete_completed(&mut self) -> usize {
            let before = self.tasks.len();
            self.tasks.retain(|t| !clearable(t));
            before - self.tasks.len()
        }
    }

    fn clearable(task: &Task) -> bool {
        task.completed && !task.hidden && !task.is_recurring()
    }

}

pub mod batch {
    //! Cooperative, cancellable units of work.
    //!
    //! A `Batch` hands out one item per `step`; the caller yields to its event loop in
    //! between. Every step boundary checks the batch's cancellation token.

    use crate::core::BatchId;
    use tokio_util::sync::CancellationToken;
    use tracing::debug;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Step<T> {
        Item(T),
        Done,
        Cancelled,
    }

    #[derive(Debug)]
    pub struct Batch<I> {
        id: BatchId,
        token: CancellationToken,
        work: I,
    }

    impl<I: Iterator> Batch<I> {
        pub fn new(work: I) -> Self {
            Self {
                id: BatchId::new(),
                token: CancellationToken::new(),
                work,
            }
        }

        pub fn id(&self) -> BatchId {
            self.id
        }

        pub fn token(&self) -> CancellationToken {
            self.token.clone()
        }

        pub fn is_cancelled(&self) -> bool {
            self.token.is_cancelled()
        }

        pub fn step(&mut self) -> Step<I::Item> {
            if self.token.is_cancelled() {
                return Step::Cancelled;
            }
            match self.work.next() {
                Some(item) => Step::Item(item),
                None => Step::Done,
            }
        }
    }

    /// Yields items until the work is exhausted or the batch is cancelled.
    impl<I: Iterator> Iterator for Batch<I> {
        type Item = I::Item;

        fn next(&mut self) -> Option<Self::Item> {
            match self.step() {
                Step::Item(item) => Some(item),
                Step::Done | Step::Cancelled => None,
            }
        }
    }

    /// At most one in-flight batch per slot.
    #[derive(Debug, Default)]
    pub struct BatchSlot {
        current: Option<(BatchId, CancellationToken)>,
    }

    impl BatchSlot {
        pub fn new() -> Self {
            Self::default()
        }

        /// Cancel whatever is in flight and start a batch over `work`.
        pub fn begin<I: Iterator>(&mut self, work: I) -> Batch<I> {
            self.cancel();
            let batch = Batch::new(work);
            debug!(batch = %batch.id().0, "batch started");
            self.current = Some((batch.id(), batch.token()));
            batch
        }

        pub fn in_flight(&self) -> Option<BatchId> {
            self.current.as_ref().map(|(id, _)| *id)
        }

        pub fn is_current(&self, id: BatchId) -> bool {
            self.in_flight() == Some(id)
        }

        /// Clear the slot if `id` is still the in-flight batch.
        pub fn finish(&mut self, id: BatchId) -> bool {
            if !self.is_current(id) {
                debug!(batch = %id.0, "stale batch finished");
                return false;
            }
            self.current = None;
            debug!(batch = %id.0, "batch finished");
            true
        }

        pub fn cancel(&mut self) {
            if let Some((id, token)) = self.current.take() {
                token.cancel();
                debug!(batch = %id.0, "batch cancelled");
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn steps_until_done() {
            let mut batch = Batch::new([1, 2].into_iter());
            assert_eq!(batch.step(), Step::Item(1));
            assert_eq!(batch.step(), Step::Item(2));
            assert_eq!(batch.step(), Step::Done);
        }

        #[test]
        fn new_batch_cancels_previous() {
            let mut slot = BatchSlot::new();
            let mut first = slot.begin(0..10);
            assert_eq!(first.step(), Step::Item(0));

            let second = slot.begin(0..3);
            assert_eq!(first.step(), Step::Cancelled);
            assert!(first.is_cancelled());
            assert!(!slot.finish(first.id()));
            assert!(slot.is_current(second.id()));
            assert_eq!(second.count(), 3);
        }

        #[test]
        fn finish_clears_current_only() {
            let mut slot = BatchSlot::new();
            let batch = slot.begin(std::iter::empty::<()>());
            let id = batch.id();
            assert!(slot.finish(id));
            assert!(slot.in_flight().is_none());
            assert!(!slot.finish(id));
        }

        #[test]
        fn iterator_stops_on_cancel() {
            let mut batch = Batch::new(0..100);
            let token = batch.token();
            let taken: Vec<_> = batch.by_ref().take(2).collect();
            token.cancel();
            assert_eq!(taken, [0, 1]);
            assert_eq!(batch.next(), None);
        }
    }
}

pub mod settings {
    //! Persisted view settings: sort order and filters.

    use crate::core::*;
    use crate::filter::FilterConfig;
    use crate::sort::SortSpec;
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::{debug, warn};

    /// Bump when the persisted shape changes; older documents are reset.
    pub const CACHE_FORMAT_VERSION: u32 = 1;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ViewSettings {
        pub format_version: u32,
        pub sort: SortSpec,
        pub filters: FilterConfig,
    }

    impl Default for ViewSettings {
        fn default() -> Self {
            Self {
                format_version: CACHE_FORMAT_VERSION,
                sort: SortSpec::default(),
                filters: FilterConfig::default(),
            }
        }
    }

    /// Why a persisted document was replaced by defaults.
    #[derive(Debug, thiserror::Error)]
    pub enum SettingsReset {
        #[error("format version {found:?} does not match {expected}", expected = CACHE_FORMAT_VERSION)]
        VersionMismatch { found: Option<u32> },
        #[error(transparent)]
        Malformed(#[from] serde_json::Error),
    }

    #[derive(Deserialize)]
    struct VersionProbe {
        #[serde(default)]
        format_version: Option<u32>,
    }

    impl ViewSettings {
        /// Strict parse. The version is checked before the rest is looked at.
        pub fn parse(doc: &str) -> Result<Self, SettingsReset> {
            let probe: VersionProbe = serde_json::from_str(doc)?;
            if probe.format_version != Some(CACHE_FORMAT_VERSION) {
                return Err(SettingsReset::VersionMismatch {
                    found: probe.format_version,
                });
            }
            Ok(serde_json::from_str(doc)?)
        }

        pub fn from_json_or_default(doc: &str) -> Self {
            Self::parse(doc).unwrap_or_else(|err| {
                warn!(error = %err, "resetting view settings to defaults");
                Self::default()
            })
        }

        pub fn to_json(&self) -> Result<String> {
            Ok(serde_json::to_string_pretty(self)?)
        }
    }

    #[derive(Debug, Clone)]
    pub struct SettingsFile {
        path: PathBuf,
    }

    impl SettingsFile {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Never fails: unreadable or outdated documents give the defaults.
        pub fn load(&self) -> ViewSettings {
            match fs::read_to_string(&self.path) {
                Ok(doc) => ViewSettings::from_json_or_default(&doc),
                Err(err) => {
                    warn!(path = ?self.path, error = %err, "settings unavailable, using defaults");
                    ViewSettings::default()
                }
            }
        }

        pub fn save(&self, settings: &ViewSettings) -> Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| TodoError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&self.path, settings.to_json()?).map_err(|source| TodoError::Io {
                path: self.path.clone(),
                source,
            })?;
            debug!(path = ?self.path, "settings saved");
            Ok(())
        }
    }

}

pub mod storage {
    //! Todo file access and change-notification debouncing.

    use crate::core::*;
    use std::{
        fs::{self, OpenOptions},
        io::Write,
        path::{Path, PathBuf},
    };
    use tracing::{debug, warn};

    /// Where task lines come from and go to.
    pub trait TodoRepository {
        fn read_lines(&self) -> Result<Vec<String>>;
        fn write_lines(&self, lines: &[String]) -> Result<()>;
        fn append_archive(&self, lines: &[String]) -> Result<()>;
    }

    /// Split file content on `\r?\n`, dropping lines with no visible characters.
    pub fn split_lines(content: &str) -> Vec<String> {
        content
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Every line, newline-terminated.
    pub fn join_lines(lines: &[String]) -> String {
        lines.iter().flat_map(|l| [l.as_str(), "\n"]).collect()
    }

    #[derive(Debug, Clone)]
    pub struct FileRepository {
        todo: PathBuf,
        done: Option<PathBuf>,
    }

    impl FileRepository {
        pub fn new(todo: impl Into<PathBuf>) -> Self {
            Self {
                todo: todo.into(),
                done: None,
            }
        }

        pub fn with_done_file(mut self, done: impl Into<PathBuf>) -> Self {
            self.done = Some(done.into());
            self
        }

        pub fn todo_path(&self) -> &Path {
            &self.todo
        }

        pub fn done_path(&self) -> Option<&Path> {
            self.done.as_deref()
        }
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TodoError + '_ {
        move |source| TodoError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    impl TodoRepository for FileRepository {
        fn read_lines(&self) -> Result<Vec<String>> {
            if !self.todo.exists() {
                return Err(TodoError::MissingFile(self.todo.clone()));
            }
            let content = fs::read_to_string(&self.todo).map_err(io_error(&self.todo))?;
            let lines = split_lines(&content);
            debug!(path = ?self.todo, lines = lines.len(), "todo file read");
            Ok(lines)
        }

        fn write_lines(&self, lines: &[String]) -> Result<()> {
            fs::write(&self.todo, join_lines(lines)).map_err(io_error(&self.todo))?;
            debug!(path = ?self.todo, lines = lines.len(), "todo file written");
            Ok(())
        }

        fn append_archive(&self, lines: &[String]) -> Result<()> {
            let Some(done) = &self.done else {
                warn!(lines = lines.len(), "no done file configured; archive lines dropped");
                return Ok(());
            };
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(done)
                .map_err(io_error(done))?;
            file.write_all(join_lines(lines).as_bytes())
                .map_err(io_error(done))?;
            Ok(())
        }
    }

    /* --------------------------- Change debouncing --------------------------- */

    /// File-monitor event kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FileEvent {
        Created,
        Deleted,
        Moved,
        ChangesDone,
        Changed,
        AttributeChanged,
        Unmounted,
    }

    /// Decides whether a file event should trigger a reload.
    #[derive(Debug, Default)]
    pub struct ChangeDebouncer {
        self_write_pending: bool,
    }

    impl ChangeDebouncer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Call right before writing the todo file ourselves.
        pub fn note_self_write(&mut self) {
            self.self_write_pending = true;
        }

        pub fn should_reload(&mut self, event: FileEvent) -> bool {
            if std::mem::take(&mut self.self_write_pending) {
                debug!(?event, "ignoring change caused by own write");
                return false;
            }
            matches!(
                event,
                FileEvent::Created | FileEvent::Deleted | FileEvent::Moved | FileEvent::ChangesDone
            )
        }
    }

}

pub mod engine {
    //! Session state: the task store plus every view derived from it.
    //!
    //! Mutations go through the engine so that the affected task is rebuilt first and the
    //! derived views (statistics, sorted order, viewport, search results) are recomputed
    //! exactly once afterwards.

    use crate::batch::{Batch, BatchSlot, Step};
    use crate::core::*;
    use crate::filter::{FilterCategory, FilterConfig};
    use crate::lifecycle;
    use crate::parser::{LineParser, TaskParser};
    use crate::search::{SearchOutcome, SearchSession};
    use crate::settings::ViewSettings;
    use crate::sort::{self, SortSpec};
    use crate::store::{DateCheckReport, Notifier, TaskStats, TaskStore};
    use chrono::NaiveDate;
    use std::vec;
    use tracing::{debug, info};

    /* ------------------------------ Day rollover ------------------------------ */

    /// Remembers the last date seen; a different date means a new day started.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DayTracker {
        last: Option<NaiveDate>,
    }

    impl DayTracker {
        pub fn new(today: NaiveDate) -> Self {
            Self { last: Some(today) }
        }

        pub fn last_seen(&self) -> Option<NaiveDate> {
            self.last
        }

        /// True exactly once per change of date.
        pub fn poll(&mut self, today: NaiveDate) -> bool {
            if self.last == Some(today) {
                return false;
            }
            self.last = Some(today);
            true
        }
    }

    /* -------------------------------- Batches -------------------------------- */

    /// Parses one todo line per step.
    #[derive(Debug)]
    pub struct LoadBatch {
        batch: Batch<vec::IntoIter<String>>,
        tasks: Vec<Task>,
        done: bool,
    }

    impl LoadBatch {
        pub fn id(&self) -> BatchId {
            self.batch.id()
        }

        /// Parse the next line; the item is the number of tasks parsed so far.
        pub fn step(&mut self) -> Step<usize> {
            match self.batch.step() {
                Step::Item(line) => {
                    self.tasks.push(LineParser.parse_line(&line));
                    Step::Item(self.tasks.len())
                }
                Step::Done => {
                    self.done = true;
                    Step::Done
                }
                Step::Cancelled => Step::Cancelled,
            }
        }

        /// Step until done or cancelled.
        pub fn run(&mut self) -> Step<usize> {
            loop {
                match self.step() {
                    Step::Item(_) => continue,
                    other => return other,
                }
            }
        }

        pub fn is_cancelled(&self) -> bool {
            self.batch.is_cancelled()
        }
    }

    /// Filter-tests one task per step, in sorted order.
    #[derive(Debug)]
    pub struct ViewportFill<'a> {
        tasks: &'a [Task],
        filters: &'a FilterConfig,
        batch: Batch<vec::IntoIter<TaskIndex>>,
        accepted: Vec<TaskIndex>,
    }

    impl<'a> ViewportFill<'a> {
        fn new(
            tasks: &'a [Task],
            filters: &'a FilterConfig,
            batch: Batch<vec::IntoIter<TaskIndex>>,
        ) -> Self {
            Self {
                tasks,
                filters,
                batch,
                accepted: Vec::new(),
            }
        }

        /// The item tells whether the tested task entered the viewport.
        pub fn step(&mut self) -> Step<bool> {
            match self.batch.step() {
                Step::Item(idx) => {
                    let passed = self.tasks.get(idx.0).is_some_and(|t| self.filters.passes(t));
                    if passed {
                        self.accepted.push(idx);
                    }
                    Step::Item(passed)
                }
                Step::Done => Step::Done,
                Step::Cancelled => Step::Cancelled,
            }
        }

        pub fn id(&self) -> BatchId {
            self.batch.id()
        }

        pub fn finish(self) -> (BatchId, Vec<TaskIndex>) {
            (self.batch.id(), self.accepted)
        }
    }

    /* --------------------------------- Engine --------------------------------- */

    #[derive(Debug)]
    struct ActiveSearch {
        session: SearchSession,
        last: SearchOutcome,
    }

    #[derive(Debug)]
    pub struct TodoEngine {
        store: TaskStore,
        settings: ViewSettings,
        stats: TaskStats,
        sorted: Vec<TaskIndex>,
        viewport: Vec<TaskIndex>,
        search: Option<ActiveSearch>,
        load_slot: BatchSlot,
        fill_slot: BatchSlot,
        day: DayTracker,
    }

    impl TodoEngine {
        pub fn new(settings: ViewSettings, today: NaiveDate) -> Self {
            Self {
                store: TaskStore::new(),
                settings,
                stats: TaskStats::default(),
                sorted: Vec::new(),
                viewport: Vec::new(),
                search: None,
                load_slot: BatchSlot::new(),
                fill_slot: BatchSlot::new(),
                day: DayTracker::new(today),
            }
        }

        /* ---------------------------- Accessors ---------------------------- */

        pub fn store(&self) -> &TaskStore {
            &self.store
        }

        pub fn settings(&self) -> &ViewSettings {
            &self.settings
        }

        pub fn stats(&self) -> &TaskStats {
            &self.stats
        }

        /// All tasks in sort order, unfiltered.
        pub fn sorted(&self) -> &[TaskIndex] {
            &self.sorted
        }

        /// Filtered, sorted indices eligible for display.
        pub fn viewport(&self) -> &[TaskIndex] {
            &self.viewport
        }

        pub fn viewport_tasks(&self) -> impl Iterator<Item = &Task> {
            self.viewport.iter().filter_map(|&idx| self.store.get(idx))
        }

        pub fn to_lines(&self) -> Vec<String> {
            self.store.to_lines()
        }

        /* ------------------------------ Loading ------------------------------ */

        /// Start parsing `lines`, cancelling any load still in flight.
        pub fn begin_load(&mut self, lines: Vec<String>) -> LoadBatch {
            let batch = self.load_slot.begin(lines.into_iter());
            LoadBatch {
                batch,
                tasks: Vec::new(),
                done: false,
            }
        }

        /// Install a load if it is still the current one: run the date check and
        /// recompute the views. Returns `None` for cancelled or superseded loads.
        pub fn finish_load(
            &mut self,
            mut load: LoadBatch,
            today: NaiveDate,
            notifier: &dyn Notifier,
        ) -> Option<DateCheckReport> {
            if !load.done && load.run() == Step::Cancelled {
                debug!(batch = %load.id().0, "load cancelled before completion");
                return None;
            }
            if !self.load_slot.finish(load.id()) {
                return None;
            }

            self.store = TaskStore::from_tasks(load.tasks);
            self.day = DayTracker::new(today);
            let report = self.store.check_dates(today);
            report.notify(notifier);
            self.on_tasks_changed();
            info!(tasks = self.store.len(), "todo list loaded");
            Some(report)
        }

        pub fn load_all(
            &mut self,
            lines: Vec<String>,
            today: NaiveDate,
            notifier: &dyn Notifier,
        ) -> DateCheckReport {
            let load = self.begin_load(lines);
            self.finish_load(load, today, notifier).unwrap_or_default()
        }

        /// Level-triggered rollover check. Returns the report when a new day started.
        pub fn tick(&mut self, today: NaiveDate, notifier: &dyn Notifier) -> Option<DateCheckReport> {
            if !self.day.poll(today) {
                return None;
            }
            info!(%today, "new day");
            let report = self.store.check_dates(today);
            if report.changed() {
                report.notify(notifier);
                self.on_tasks_changed();
            }
            Some(report)
        }

        /* ----------------------------- Mutations ----------------------------- */

        pub fn add_task(&mut self, line: &str, today: NaiveDate) -> TaskIndex {
            let idx = self.store.push(lifecycle::rebuild(line, today));
            self.on_tasks_changed();
            idx
        }

        pub fn edit_task(&mut self, idx: TaskIndex, line: &str, today: NaiveDate) -> bool {
            self.rebuild_with(idx, |_| lifecycle::rebuild(line, today))
        }

        pub fn remove_task(&mut self, idx: TaskIndex) -> Option<Task> {
            let removed = self.store.remove(idx)?;
            self.on_tasks_changed();
            Some(removed)
        }

        pub fn toggle_task(&mut self, idx: TaskIndex, today: NaiveDate) -> bool {
            self.rebuild_with(idx, |task| lifecycle::toggle_task(task, today))
        }

        pub fn toggle_pin(&mut self, idx: TaskIndex, today: NaiveDate) -> bool {
            self.rebuild_with(idx, |task| lifecycle::toggle_pin(task, today))
        }

        fn rebuild_with(&mut self, idx: TaskIndex, rebuild: impl FnOnce(&Task) -> Task) -> bool {
            let Some(task) = self.store.get(idx).map(rebuild) else {
                return false;
            };
            self.store.replace(idx, task);
            self.on_tasks_changed();
            true
        }

        /// Removes completed non-recurring tasks and returns their archive lines.
        pub fn archive_completed(&mut self, today: NaiveDate) -> Vec<String> {
            let lines = self.store.take_archivable(today);
            if !lines.is_empty() {
                self.on_tasks_changed();
            }
            lines
        }

        pub fn delete_completed(&mut self) -> usize {
            let removed = self.store.delete_completed();
            if removed > 0 {
                self.on_tasks_changed();
            }
            removed
        }

        /* ------------------------------- Views ------------------------------- */

        pub fn toggle_filter(&mut self, keyword: &str) -> (FilterCategory, bool) {
            let toggled = self.settings.filters.toggle_filter(keyword);
            self.refill_viewport();
            toggled
        }

        pub fn toggle_invert(&mut self) -> bool {
            let invert = self.settings.filters.toggle_invert();
            self.refill_viewport();
            invert
        }

        pub fn set_filters(&mut self, filters: FilterConfig) {
            self.settings.filters = filters;
            self.refill_viewport();
        }

        pub fn set_sort(&mut self, spec: SortSpec) {
            self.settings.sort = spec;
            self.on_tasks_changed();
        }

        /// Recompute statistics, prune stale filters, resort and refill the viewport.
        pub fn on_tasks_changed(&mut self) {
            self.stats = self.store.stats();
            self.settings.filters.prune_stale(&self.stats);

            let mut order: Vec<TaskIndex> = self.store.indices().collect();
            sort::sort_indices(self.store.tasks(), &mut order, &self.settings.sort);
            self.sorted = order;

            self.refill_viewport();
            self.rerun_search();
        }

        /// Start a cooperative viewport refill, cancelling one still in flight.
        pub fn begin_viewport_fill(&mut self) -> ViewportFill<'_> {
            let batch = self.fill_slot.begin(self.sorted.clone().into_iter());
            ViewportFill::new(self.store.tasks(), &self.settings.filters, batch)
        }

        /// Install the result of a finished fill if it is still current.
        pub fn install_viewport(&mut self, id: BatchId, viewport: Vec<TaskIndex>) -> bool {
            if !self.fill_slot.finish(id) {
                return false;
            }
            self.viewport = viewport;
            true
        }

        fn refill_viewport(&mut self) {
            let mut fill = self.begin_viewport_fill();
            while let Step::Item(_) = fill.step() {}
            let (id, viewport) = fill.finish();
            self.install_viewport(id, viewport);
        }

        /* ------------------------------- Search ------------------------------- */

        pub fn search_active(&self) -> bool {
            self.search.is_some()
        }

        /// Run `query`, opening a search session on first use. Searches all tasks
        /// in sort order.
        pub fn search(&mut self, query: &str) -> &SearchOutcome {
            let tasks = self.store.tasks();
            let sorted = &self.sorted;
            let active = self.search.get_or_insert_with(|| {
                debug!("search session opened");
                let mut session = SearchSession::new();
                let last = session.search(tasks, sorted, "");
                ActiveSearch { session, last }
            });
            active.last = active.session.search(tasks, sorted, query);
            &active.last
        }

        pub fn close_search(&mut self) {
            if let Some(mut active) = self.search.take() {
                active.session.clear();
                debug!("search session closed");
            }
        }

        /// Indices became stale: drop the cache and repeat the last query.
        fn rerun_search(&mut self) {
            let Some(active) = self.search.as_mut() else {
                return;
            };
            active.session.clear();
            let query = active.last.query.clone();
            active.last = active.session.search(self.store.tasks(), &self.sorted, &query);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::search::SearchSource;
        use crate::store::LogNotifier;
        use std::cell::RefCell;

        fn d(s: &str) -> NaiveDate {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
        }

        fn lines(raw: &[&str]) -> Vec<String> {
            raw.iter().map(|l| l.to_string()).collect()
        }

        fn loaded(raw: &[&str], today: NaiveDate) -> TodoEngine {
            let mut engine = TodoEngine::new(ViewSettings::default(), today);
            engine.load_all(lines(raw), today, &LogNotifier);
            engine
        }

        fn viewport_text(engine: &TodoEngine) -> Vec<String> {
            engine.viewport_tasks().map(|t| t.raw_text.clone()).collect()
        }

        #[derive(Default)]
        struct Collect(RefCell<Vec<String>>);

        impl Notifier for Collect {
            fn notify(&self, message: &str) {
                self.0.borrow_mut().push(message.to_string());
            }
        }

        #[test]
        fn priority_filter_scenario() {
            let mut engine = loaded(&["(B) Second", "(A) First"], d("2024-06-01"));
            assert_eq!(viewport_text(&engine), ["(A) First", "(B) Second"]);
            engine.toggle_filter("(A)");
            assert_eq!(viewport_text(&engine), ["(A) First"]);
            engine.toggle_invert();
            assert_eq!(viewport_text(&engine), ["(B) Second"]);
        }

        #[test]
        fn superseded_load_is_discarded() {
            let today = d("2024-06-01");
            let mut engine = TodoEngine::new(ViewSettings::default(), today);
            let mut stale = engine.begin_load(lines(&["old one", "old two"]));
            assert_eq!(stale.step(), Step::Item(1));

            let fresh = engine.begin_load(lines(&["new"]));
            assert_eq!(stale.step(), Step::Cancelled);
            assert!(engine.finish_load(stale, today, &LogNotifier).is_none());
            assert!(engine.store().is_empty());

            assert!(engine.finish_load(fresh, today, &LogNotifier).is_some());
            assert_eq!(engine.to_lines(), ["new"]);
        }

        #[test]
        fn load_reports_date_check() {
            let sink = Collect::default();
            let today = d("2024-01-04");
            let mut engine = TodoEngine::new(ViewSettings::default(), today);
            let report = engine.load_all(lines(&["2024-01-01 Water rec:1d"]), today, &sink);
            assert_eq!(report.recurred, 1);
            assert_eq!(sink.0.into_inner(), ["1 task has recurred"]);
            assert_eq!(engine.to_lines(), ["2024-01-04 Water rec:1d"]);
        }

        #[test]
        fn tick_fires_once_per_new_day() {
            let sink = Collect::default();
            let mut engine = loaded(&["Taxes t:2024-06-02"], d("2024-06-01"));
            assert!(engine.viewport().is_empty());
            assert!(engine.tick(d("2024-06-01"), &sink).is_none());

            let report = engine.tick(d("2024-06-02"), &sink).unwrap();
            assert_eq!(report.opened, 1);
            assert_eq!(viewport_text(&engine), ["Taxes t:2024-06-02"]);
            assert!(engine.tick(d("2024-06-02"), &sink).is_none());
            assert_eq!(sink.0.into_inner(), ["1 deferred task has been opened"]);
        }

        #[test]
        fn mutations_rebuild_and_resort() {
            let today = d("2024-06-01");
            let mut engine = loaded(&["(B) b", "(A) a"], today);
            let idx = engine.add_task("(C) c @desk", today);
            assert_eq!(engine.stats().contexts.get("@desk"), Some(&1));

            assert!(engine.toggle_task(idx, today));
            assert_eq!(
                engine.store().get(idx).map(|t| t.raw_text.as_str()),
                Some("x 2024-06-01 c @desk pri:C")
            );
            assert_eq!(engine.stats().completed, 1);

            assert!(engine.toggle_pin(TaskIndex(0), today));
            assert_eq!(viewport_text(&engine)[0], "(B) b pin:1");

            assert!(engine.edit_task(TaskIndex(1), "(A) a renamed", today));
            assert!(!engine.edit_task(TaskIndex(9), "nope", today));
            let removed = engine.remove_task(TaskIndex(1)).map(|t| t.raw_text);
            assert_eq!(removed.as_deref(), Some("(A) a renamed"));
        }

        #[test]
        fn archive_and_delete_completed() {
            let today = d("2024-06-01");
            let mut engine = loaded(&["x 2024-05-01 old", "open", "x 2024-05-02 older"], today);
            assert_eq!(
                engine.archive_completed(today),
                ["x 2024-05-01 old", "x 2024-05-02 older"]
            );
            assert_eq!(engine.to_lines(), ["open"]);
            assert_eq!(engine.delete_completed(), 0);
        }

        #[test]
        fn stale_filters_pruned_after_changes() {
            let today = d("2024-06-01");
            let mut engine = loaded(&["Sweep @home", "Call @work"], today);
            engine.toggle_filter("@home");
            assert_eq!(viewport_text(&engine), ["Sweep @home"]);
            engine.remove_task(TaskIndex(0));
            assert!(engine.settings().filters.contexts.is_empty());
            assert_eq!(viewport_text(&engine), ["Call @work"]);
        }

        #[test]
        fn search_reuses_prefix_and_refreshes_on_change() {
            let today = d("2024-06-01");
            let mut engine = loaded(&["Buy milk", "Mix paint", "Walk dog"], today);
            assert_eq!(engine.search("mi").source, SearchSource::FullScan);
            let out = engine.search("milk");
            assert_eq!(
                out.source,
                SearchSource::Narrowed {
                    from: "mi".into()
                }
            );
            assert_eq!(out.results.len(), 1);

            engine.add_task("Milk the cow", today);
            assert!(engine.search_active());
            assert_eq!(engine.search("milk").source, SearchSource::CacheHit);
            assert_eq!(engine.search("milk").results.len(), 2);

            engine.close_search();
            assert!(!engine.search_active());
        }

        #[test]
        fn cooperative_viewport_fill_can_be_superseded() {
            let today = d("2024-06-01");
            let mut engine = loaded(&["a", "b"], today);
            let (stale_id, partial) = {
                let mut fill = engine.begin_viewport_fill();
                assert_eq!(fill.step(), Step::Item(true));
                fill.finish()
            };
            engine.toggle_invert();
            assert!(!engine.install_viewport(stale_id, partial));
        }

        #[test]
        fn day_tracker_reports_changes_once() {
            let mut tracker = DayTracker::new(d("2024-06-01"));
            assert!(!tracker.poll(d("2024-06-01")));
            assert!(tracker.poll(d("2024-06-02")));
            assert!(!tracker.poll(d("2024-06-02")));
            assert_eq!(tracker.last_seen(), Some(d("2024-06-02")));
        }
    }
}

pub use crate::core::{
    BatchId, DomainError, Priority, RecurrenceKind, RecurrenceRule, Result, Task, TaskIndex,
    TodoError,
};
pub use crate::engine::TodoEngine;
pub use crate::filter::FilterConfig;
pub use crate::format::format_task;
pub use crate::parser::parse_task;
pub use crate::settings::{SettingsFile, ViewSettings};
pub use crate::sort::{SortKey, SortOrder, SortSpec};
pub use crate::storage::{FileRepository, TodoRepository};
pub use crate::store::{DateCheckReport, Notifier, TaskStats, TaskStore};
