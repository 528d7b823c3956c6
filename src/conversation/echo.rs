//! Echo suppression
//!
//! The microphone keeps running while the agent talks, so the recognizer hears
//! the agent's own voice. Fragments that overlap what was just spoken, or that
//! are only an activation/acknowledgement phrase, must not drive turn-taking.

/// Default number of leading characters of spoken text used for overlap checks
pub const DEFAULT_ECHO_WINDOW: usize = 20;

/// Short noises the recognizer produces from breathing or hesitation
pub const DEFAULT_FILLER_PHRASES: &[&str] = &["hmm", "um", "uh", "okay", "ok"];

/// Lowercase, drop punctuation, collapse whitespace
#[must_use]
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else if c.is_whitespace() {
            pending_space = true;
        }
        // apostrophes and other punctuation vanish so "I'm" == "im"
    }
    out
}

/// Decides which transcript fragments to ignore
#[derive(Debug, Clone)]
pub struct EchoFilter {
    last_spoken: String,
    // Ignored only when heard exactly
    phrases: Vec<String>,
    // Ignored while the recognizer is still spelling them out
    wake_phrases: Vec<String>,
    window: usize,
}

impl Default for EchoFilter {
    fn default() -> Self {
        Self::new(DEFAULT_FILLER_PHRASES.iter().copied(), DEFAULT_ECHO_WINDOW)
    }
}

impl EchoFilter {
    /// Create a filter that ignores the given activation/acknowledgement phrases
    pub fn new<I, S>(phrases: I, window: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            last_spoken: String::new(),
            phrases,
            wake_phrases: Vec::new(),
            window: window.max(1),
        }
    }

    /// Add phrases ignored when heard exactly (acknowledgements)
    pub fn extend_phrases<I, S>(&mut self, phrases: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        extend_unique(&mut self.phrases, phrases);
    }

    /// Add wake phrases; their leading words are ignored too
    pub fn extend_wake_phrases<I, S>(&mut self, phrases: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        extend_unique(&mut self.wake_phrases, phrases);
    }

    /// Remember what the agent is about to say
    pub fn remember_spoken(&mut self, text: &str) {
        self.last_spoken = normalize(text);
    }

    /// Forget the agent's last utterance
    pub fn forget_spoken(&mut self) {
        self.last_spoken.clear();
    }

    /// Normalized text of the agent's last utterance
    #[must_use]
    pub fn last_spoken(&self) -> &str {
        &self.last_spoken
    }

    /// Whether the fragment is the agent hearing itself
    #[must_use]
    pub fn is_echo(&self, fragment: &str) -> bool {
        let fragment = normalize(fragment);
        self.is_echo_normalized(&fragment)
    }

    fn is_echo_normalized(&self, fragment: &str) -> bool {
        if fragment.is_empty() || self.last_spoken.is_empty() {
            return false;
        }

        // Recognizer caught the start of our sentence
        if self.last_spoken.starts_with(fragment) {
            return true;
        }

        // Fragment starts with our opening words and runs on
        let head: String = self.last_spoken.chars().take(self.window).collect();
        if head.chars().count() >= self.window && fragment.starts_with(&head) {
            return true;
        }

        // Late tail of the reply arriving after the transcript was marked
        if self.last_spoken.ends_with(&format!(" {fragment}")) {
            return true;
        }

        // Picked up somewhere in the middle of a longer reply
        fragment.split(' ').count() >= 2 && self.last_spoken.contains(fragment)
    }

    /// Drop the leading words the fragment shares with the agent's last utterance
    ///
    /// Returns the normalized remainder, which is what the user said over the
    /// agent once the echoed opening is removed.
    #[must_use]
    pub fn strip_echo(&self, fragment: &str) -> String {
        let fragment = normalize(fragment);
        if self.last_spoken.is_empty() || fragment.is_empty() {
            return fragment;
        }

        let words: Vec<&str> = fragment.split(' ').collect();
        let overlap = words
            .iter()
            .zip(self.last_spoken.split(' '))
            .take_while(|(heard, spoken)| *heard == spoken)
            .count();
        words[overlap..].join(" ")
    }

    /// Whether the fragment is only an activation/acknowledgement phrase
    #[must_use]
    pub fn is_filler(&self, fragment: &str) -> bool {
        let fragment = normalize(fragment);
        self.is_filler_normalized(&fragment)
    }

    fn is_filler_normalized(&self, fragment: &str) -> bool {
        if fragment.is_empty() {
            return false;
        }
        self.phrases.iter().any(|p| p == fragment)
            || self.wake_phrases.iter().any(|p| {
                p == fragment
                    || p.strip_prefix(fragment)
                        .is_some_and(|rest| rest.starts_with(' '))
            })
    }

    /// Whether turn-taking and barge-in decisions should skip this fragment
    #[must_use]
    pub fn should_ignore(&self, fragment: &str) -> bool {
        let fragment = normalize(fragment);
        fragment.is_empty()
            || self.is_filler_normalized(&fragment)
            || self.is_echo_normalized(&fragment)
    }
}

fn extend_unique<I, S>(list: &mut Vec<String>, phrases: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for phrase in phrases {
        let normalized = normalize(phrase.as_ref());
        if !normalized.is_empty() && !list.contains(&normalized) {
            list.push(normalized);
        }
    }
}
