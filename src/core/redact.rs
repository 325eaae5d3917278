//! Secret redaction for subprocess output.
//!
//! The [`Redactor`] replaces every occurrence of a secret value with
//! [`MASK`]. It works on raw bytes and is streaming-safe: when a chunk ends
//! with bytes that could be the beginning of a secret, those bytes are held
//! back until the next chunk (or [`Redactor::finish`]) decides them.

/// Token written in place of a secret value
pub const MASK: &str = "****";

/// Streaming secret masker
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Secret values, longest first so overlapping secrets mask fully
    secrets: Vec<Vec<u8>>,

    /// Bytes not yet emitted (possible secret prefix)
    pending: Vec<u8>,
}

impl Redactor {
    /// Create a redactor for the given secret values (empty values are ignored)
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut secrets: Vec<Vec<u8>> = secrets
            .into_iter()
            .map(|s| s.as_ref().as_bytes().to_vec())
            .filter(|s| !s.is_empty())
            .collect();

        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();

        Self {
            secrets,
            pending: Vec::new(),
        }
    }

    /// True when there is nothing to mask
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Feed a chunk of output, returning the bytes that are safe to emit
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.secrets.is_empty() {
            return chunk.to_vec();
        }

        self.pending.extend_from_slice(chunk);
        let (out, consumed) = scan(&self.secrets, &self.pending, false);
        self.pending.drain(..consumed);
        out
    }

    /// Flush held-back bytes at end of stream
    pub fn finish(&mut self) -> Vec<u8> {
        let (out, _) = scan(&self.secrets, &self.pending, true);
        self.pending.clear();
        out
    }

    /// Redact a complete string in one pass
    pub fn redact(&self, text: &str) -> String {
        if self.secrets.is_empty() {
            return text.to_string();
        }

        let (out, _) = scan(&self.secrets, text.as_bytes(), true);
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Mask secrets in `buf`. Without `at_end`, stops at the first position whose
/// remaining bytes are a proper prefix of a secret and reports how much was consumed.
fn scan(secrets: &[Vec<u8>], buf: &[u8], at_end: bool) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;

    'scan: while i < buf.len() {
        let rest = &buf[i..];

        for secret in secrets {
            if rest.starts_with(secret) {
                out.extend_from_slice(MASK.as_bytes());
                i += secret.len();
                continue 'scan;
            }
        }

        if !at_end
            && secrets
                .iter()
                .any(|s| s.len() > rest.len() && s.starts_with(rest))
        {
            break;
        }

        out.push(buf[i]);
        i += 1;
    }

    (out, i)
}

/// Captured output that keeps only the most recent `limit` bytes
#[derive(Debug, Clone)]
pub struct OutputCapture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputCapture {
    /// Create a capture buffer bounded to `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append already-redacted bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.truncated = true;
        }
    }

    /// Whether older output was dropped
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Convert to text (lossy for invalid UTF-8)
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(redactor: &mut Redactor, chunks: &[&str]) -> String {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(redactor.push(chunk.as_bytes()));
        }
        out.extend(redactor.finish());
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_redact_single_pass() {
        let redactor = Redactor::new(["hunter2"]);
        assert_eq!(
            redactor.redact("login with hunter2 and hunter2!"),
            "login with **** and ****!"
        );
    }

    #[test]
    fn test_secret_split_across_chunks() {
        let mut redactor = Redactor::new(["s3cr3t-value"]);
        let out = stream(&mut redactor, &["token=s3c", "r3t-va", "lue\n"]);
        assert_eq!(out, "token=****\n");
    }

    #[test]
    fn test_held_back_prefix_flushed_at_end() {
        let mut redactor = Redactor::new(["abcdef"]);
        let out = stream(&mut redactor, &["xx abc"]);
        assert_eq!(out, "xx abc");
    }

    #[test]
    fn test_overlapping_secrets_prefer_longest() {
        let redactor = Redactor::new(["pass", "password123"]);
        assert_eq!(redactor.redact("password123 pass"), "**** ****");
    }

    #[test]
    fn test_empty_secret_ignored() {
        let redactor = Redactor::new(["", ""]);
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("unchanged"), "unchanged");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut redactor = Redactor::new(["topsecret"]);
        let text = "a topsecret b topsec";
        let chunks: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        assert_eq!(stream(&mut redactor, &refs), "a **** b topsec");
    }

    #[test]
    fn test_capture_keeps_tail() {
        let mut capture = OutputCapture::new(5);
        capture.push(b"hello ");
        capture.push(b"world");
        assert!(capture.truncated());
        assert_eq!(capture.into_string(), "world");
    }
}
