//! Request phase of a client session.

use plaincli_protocol::Frame;

/// Encoding announced by [`Request::from_env`].
pub const DEFAULT_ENCODING: &str = "UTF-8";

/// Arguments plus the negotiated locale and encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Command name first, then its arguments.
    pub args: Vec<String>,
    pub locale: Option<String>,
    pub encoding: Option<String>,
}

impl Request {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            locale: None,
            encoding: None,
        }
    }

    /// Builds a request carrying the local process's locale and UTF-8.
    ///
    /// The locale comes from `LC_ALL`, falling back to `LANG`.
    pub fn from_env<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let locale = ["LC_ALL", "LANG"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find_map(|value| locale_name(&value));
        Self {
            locale,
            encoding: Some(DEFAULT_ENCODING.to_string()),
            ..Self::new(args)
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Frames of the request phase, in send order: ARGs, LOCALE, ENCODING, START.
    pub fn frames(&self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self.args.iter().cloned().map(Frame::Arg).collect();
        if let Some(locale) = &self.locale {
            frames.push(Frame::Locale(locale.clone()));
        }
        if let Some(encoding) = &self.encoding {
            frames.push(Frame::Encoding(encoding.clone()));
        }
        frames.push(Frame::Start);
        frames
    }
}

/// Extracts the language part of a POSIX locale value (`en_US.UTF-8@euro` -> `en_US`).
///
/// Returns `None` for unset or neutral locales.
pub fn locale_name(value: &str) -> Option<String> {
    let name = value
        .split(|c| c == '.' || c == '@')
        .next()
        .unwrap_or_default()
        .trim();
    match name {
        "" | "C" | "POSIX" => None,
        name => Some(name.to_string()),
    }
}
