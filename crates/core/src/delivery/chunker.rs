use std::ops::Range;

pub const FENCE: &str = "```";

/// Segment size used when the caller has no platform-specific limit.
pub const DEFAULT_SAFE_LIMIT: usize = 3800;

const REOPEN: &str = "```\n";

// Closing a fence costs at most "\n```".
const CLOSE_RESERVE: usize = 4;

/// Smallest limit that fits a reopen marker, a closing marker and one character.
pub const MIN_SEGMENT_LIMIT: usize = REOPEN.len() + CLOSE_RESERVE + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySegment {
    pub index: usize,
    pub text: String,
    body: Range<usize>,
}

impl DeliverySegment {
    /// The slice of the source text this segment carries, without synthetic fences.
    pub fn content(&self) -> &str {
        &self.text[self.body.clone()]
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn reopened(&self) -> bool {
        self.body.start > 0
    }

    pub fn closed(&self) -> bool {
        self.body.end < self.text.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("segment limit {limit} is below the minimum of {MIN_SEGMENT_LIMIT}")]
pub struct LimitTooSmall {
    pub limit: usize,
}

/// A line toggles the fence state when its trimmed content starts with the marker.
/// Opening and closing lines are not told apart.
pub fn is_fence_line(line: &str) -> bool {
    line.trim_start().starts_with(FENCE)
}

/// Splits `text` into segments of at most `limit` characters. Every segment has
/// balanced fences: a block cut by a boundary is closed before it and reopened
/// after it.
pub fn split(text: &str, limit: usize) -> Result<Vec<DeliverySegment>, LimitTooSmall> {
    if limit < MIN_SEGMENT_LIMIT {
        return Err(LimitTooSmall { limit });
    }

    let mut chunker = Chunker::new(limit);
    for line in text.split_inclusive('\n') {
        chunker.push_line(line);
    }
    Ok(chunker.finish())
}

struct Chunker {
    limit: usize,
    segments: Vec<DeliverySegment>,
    buf: String,
    // Characters in `buf`.
    size: usize,
    // Byte offset in `buf` where source content starts (after a reopen marker).
    body_start: usize,
    in_fence: bool,
}

impl Chunker {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            segments: Vec::new(),
            buf: String::new(),
            size: 0,
            body_start: 0,
            in_fence: false,
        }
    }

    fn has_content(&self) -> bool {
        self.buf.len() > self.body_start
    }

    /// Room needed to append `len` chars and still close the fence afterwards.
    fn fits(&self, len: usize, toggles: bool) -> bool {
        let reserve = if self.in_fence != toggles { CLOSE_RESERVE } else { 0 };
        self.size + len + reserve <= self.limit
    }

    fn append(&mut self, piece: &str, toggles: bool) {
        self.buf.push_str(piece);
        self.size += piece.chars().count();
        if toggles {
            self.in_fence = !self.in_fence;
        }
    }

    fn push_line(&mut self, line: &str) {
        let len = line.chars().count();
        let toggles = is_fence_line(line);
        if self.fits(len, toggles) {
            self.append(line, toggles);
            return;
        }

        if self.has_content() {
            self.flush();
            if self.fits(len, toggles) {
                self.append(line, toggles);
                return;
            }
        }

        self.hard_split(line);
    }

    /// Cuts an oversized line into slices, each flushed as its own segment except
    /// the last, which stays buffered. Entered with a fresh buffer only.
    ///
    /// Every slice starts a line in its segment, so a slice that begins with the
    /// marker toggles like a fence line of its own.
    fn hard_split(&mut self, line: &str) {
        let mut rest = line;
        loop {
            let toggles = is_fence_line(rest);
            let rest_len = rest.chars().count();
            if self.fits(rest_len, toggles) {
                self.append(rest, toggles);
                return;
            }

            let reserve = if self.in_fence != toggles { CLOSE_RESERVE } else { 0 };
            let room = self.limit - self.size - reserve;
            let cut = slice_cut(rest, room);
            let (head, tail) = rest.split_at(cut);

            self.append(head, toggles);
            self.flush();
            rest = tail;
        }
    }

    /// Emits the buffer as a segment, closing an open fence, and seeds the next
    /// buffer with a reopen marker when the block continues.
    fn flush(&mut self) {
        if !self.has_content() {
            return;
        }

        let body_end = self.buf.len();
        if self.in_fence {
            if !self.buf.ends_with('\n') {
                self.buf.push('\n');
            }
            self.buf.push_str(FENCE);
        }

        let text = std::mem::take(&mut self.buf);
        self.segments.push(DeliverySegment {
            index: self.segments.len(),
            text,
            body: self.body_start..body_end,
        });

        self.size = 0;
        self.body_start = 0;
        if self.in_fence {
            self.buf.push_str(REOPEN);
            self.size = REOPEN.len();
            self.body_start = REOPEN.len();
        }
    }

    fn finish(mut self) -> Vec<DeliverySegment> {
        self.flush();
        self.segments
    }
}

/// Byte offset to cut `rest` after at most `room` chars. The cut moves back
/// when the remainder would start with a fence marker that is mid-line in the
/// source; it stays put only when no earlier non-empty cut avoids that.
fn slice_cut(rest: &str, room: usize) -> usize {
    let cut = rest
        .char_indices()
        .nth(room)
        .map_or(rest.len(), |(idx, _)| idx);
    if cut == rest.len() || !is_fence_line(&rest[cut..]) {
        return cut;
    }

    rest[..cut]
        .char_indices()
        .map(|(idx, _)| idx)
        .rev()
        .find(|&idx| idx > 0 && !is_fence_line(&rest[idx..]))
        .unwrap_or(cut)
}
