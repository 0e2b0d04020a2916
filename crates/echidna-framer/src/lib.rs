//! Scans a [`RingBuffer`] for complete FASTQ/FASTA records and hands each one
//! to a caller-supplied sink policy.
//!
//! A [`Framer`] starts format-undecided: it peeks the first buffered byte to
//! pick FASTQ (`@`) or FASTA (`>`) and then rewrites its own tag in place so
//! no further per-call dispatch is paid. The FASTA scanner persists its
//! "inside a header line" bit directly on the ring buffer's flag byte so it
//! survives across fills; the FASTQ scanner needs no persisted bit because
//! it always restarts counting from the buffer's `front`.
//!
//! Framing never allocates: record boundaries are found by walking
//! [`RingBuffer::iter_filled`], an iterator over the buffer's logical
//! contents that hides the wraparound arithmetic from the scanner.

use echidna_ring::RingBuffer;
use std::fmt;

pub use echidna_error::Diagnostic;
pub use echidna_ring::NoSpace;

/// Which role a [`Framer`] plays. Only a worker-side framer may select
/// FASTA; the inlet framer (reading stdin) has no FASTA splitting rule
/// defined and treats a leading `>` as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Inlet,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTag {
    Undecided,
    Fastq,
    Fasta,
}

/// A fatal framing error: the input cannot be framed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingFatal {
    /// The first byte of the stream is neither `@` nor `>`.
    UnknownFormat,
    /// The inlet (stdin) selected FASTA, which this framer does not
    /// support splitting for (see the crate-level Open Question carried
    /// from the original implementation).
    FastaInletUnsupported,
}

impl fmt::Display for FramingFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingFatal::UnknownFormat => {
                write!(f, "unknown input format: first byte is not '@' or '>'")
            }
            FramingFatal::FastaInletUnsupported => {
                write!(f, "FASTA framing on stdin is not implemented")
            }
        }
    }
}

impl std::error::Error for FramingFatal {}

/// What happened when the framer handed a complete record to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Delivered,
    NoSpace,
}

/// Scans one ring buffer for complete records. Holds the per-buffer format
/// selection and a running line count used only for diagnostics.
pub struct Framer {
    role: Role,
    format: FormatTag,
    lineno: u64,
}

impl Framer {
    pub fn new(role: Role) -> Self {
        Self { role, format: FormatTag::Undecided, lineno: 0 }
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    pub fn lineno(&self) -> u64 {
        self.lineno
    }

    /// Scans `src` for as many complete records as it can deliver, calling
    /// `sink` once per record with the record's length. `sink` performs the
    /// actual `transfer` into whatever destination buffer it chooses and
    /// reports whether the transfer succeeded. Framing stops as soon as a
    /// record can't be delivered, leaving it as the new head of `src` so the
    /// next call resumes correctly — `src.front` is never advanced past a
    /// record that wasn't actually handed off.
    pub fn run(
        &mut self,
        src: &mut RingBuffer,
        diagnostics: &mut Vec<Diagnostic>,
        mut sink: impl FnMut(&mut RingBuffer, usize) -> SinkOutcome,
    ) -> Result<(), FramingFatal> {
        if self.format == FormatTag::Undecided {
            match src.iter_filled().next() {
                None => return Ok(()),
                Some(b'@') => self.format = FormatTag::Fastq,
                Some(b'>') => {
                    if self.role == Role::Inlet {
                        return Err(FramingFatal::FastaInletUnsupported);
                    }
                    self.format = FormatTag::Fasta;
                }
                Some(_) => return Err(FramingFatal::UnknownFormat),
            }
        }

        match self.format {
            FormatTag::Fastq => self.scan_fastq(src, diagnostics, &mut sink),
            FormatTag::Fasta => self.scan_fasta(src, &mut sink),
            FormatTag::Undecided => unreachable!("format resolved above"),
        }
        Ok(())
    }

    fn scan_fastq(
        &mut self,
        src: &mut RingBuffer,
        diagnostics: &mut Vec<Diagnostic>,
        sink: &mut impl FnMut(&mut RingBuffer, usize) -> SinkOutcome,
    ) {
        loop {
            let mut newlines = 0u32;
            let mut record_len = None;
            let mut i = 0usize;
            for b in src.iter_filled() {
                i += 1;
                if b == b'\n' {
                    newlines += 1;
                    if newlines == 4 {
                        record_len = Some(i);
                        break;
                    }
                }
            }
            let Some(len) = record_len else { return };

            if src.iter_filled().next() != Some(b'@') {
                diagnostics.push(Diagnostic::UnalignedFastq { line: self.lineno });
            }

            match sink(src, len) {
                SinkOutcome::Delivered => self.lineno += 4,
                SinkOutcome::NoSpace => return,
            }
        }
    }

    fn scan_fasta(&mut self, src: &mut RingBuffer, sink: &mut impl FnMut(&mut RingBuffer, usize) -> SinkOutcome) {
        loop {
            let mut header_read = src.flag() != 0;
            let mut record_len = None;
            let mut i = 0usize;
            for b in src.iter_filled() {
                if b == b'\n' {
                    self.lineno += 1;
                }
                if !header_read {
                    if b == b'\n' {
                        header_read = true;
                    }
                    i += 1;
                } else if b == b'>' {
                    record_len = Some(i);
                    break;
                } else {
                    i += 1;
                }
            }

            let Some(len) = record_len else {
                src.set_flag(header_read as u8);
                return;
            };

            match sink(src, len) {
                SinkOutcome::Delivered => src.set_flag(0),
                SinkOutcome::NoSpace => {
                    src.set_flag(header_read as u8);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collector {
        capacity: usize,
        sink: RingBuffer,
    }

    impl Collector {
        fn new(capacity: usize) -> Self {
            Self { capacity, sink: RingBuffer::new(capacity) }
        }

        fn deliver(&mut self, src: &mut RingBuffer, len: usize) -> SinkOutcome {
            match self.sink.transfer(src, len) {
                Ok(()) => SinkOutcome::Delivered,
                Err(_) => SinkOutcome::NoSpace,
            }
        }
    }

    #[test]
    fn frames_two_fastq_records() {
        let mut src = RingBuffer::new(256);
        src.put(b"@A\nACGT\n+\n!!!!\n@B\nTTTT\n+\n####\n").unwrap();
        let mut framer = Framer::new(Role::Inlet);
        let mut diags = Vec::new();
        let mut out = Collector::new(256);

        framer.run(&mut src, &mut diags, |s, n| out.deliver(s, n)).unwrap();

        assert!(diags.is_empty());
        assert!(src.is_empty());
        assert_eq!(out.sink.occupancy(), "@A\nACGT\n+\n!!!!\n@B\nTTTT\n+\n####\n".len());
    }

    #[test]
    fn unaligned_fastq_emits_diagnostic_but_keeps_framing() {
        let mut src = RingBuffer::new(256);
        // four lines but the record does not start with '@'
        src.put(b"XA\nACGT\n+\n!!!!\n").unwrap();
        let mut framer = Framer::new(Role::Worker);
        let mut diags = Vec::new();
        let mut out = Collector::new(256);

        framer.run(&mut src, &mut diags, |s, n| out.deliver(s, n)).unwrap();

        assert_eq!(diags, vec![Diagnostic::UnalignedFastq { line: 0 }]);
        assert!(src.is_empty());
    }

    #[test]
    fn undecided_format_rejects_unknown_leader() {
        let mut src = RingBuffer::new(64);
        src.put(b"Xabc").unwrap();
        let mut framer = Framer::new(Role::Inlet);
        let mut diags = Vec::new();
        let mut out = Collector::new(64);

        let err = framer.run(&mut src, &mut diags, |s, n| out.deliver(s, n)).unwrap_err();
        assert_eq!(err, FramingFatal::UnknownFormat);
    }

    #[test]
    fn inlet_framer_rejects_fasta() {
        let mut src = RingBuffer::new(64);
        src.put(b">r1\nACGT\n").unwrap();
        let mut framer = Framer::new(Role::Inlet);
        let mut diags = Vec::new();
        let mut out = Collector::new(64);

        let err = framer.run(&mut src, &mut diags, |s, n| out.deliver(s, n)).unwrap_err();
        assert_eq!(err, FramingFatal::FastaInletUnsupported);
    }

    #[test]
    fn fasta_framer_holds_back_trailing_partial_record() {
        let mut src = RingBuffer::new(256);
        src.put(b">r1\nACGT\nACGT\n>r2\nTTTT\n").unwrap();
        let mut framer = Framer::new(Role::Worker);
        let mut diags = Vec::new();
        let mut out = Collector::new(256);

        framer.run(&mut src, &mut diags, |s, n| out.deliver(s, n)).unwrap();

        assert_eq!(out.sink.contiguous_filled(), b">r1\nACGT\nACGT\n");
        // the second record has no closing '>' yet, so it stays in src
        assert_eq!(src.contiguous_filled(), b">r2\nTTTT\n");
    }

    #[test]
    fn stops_without_advancing_front_on_no_space() {
        let mut src = RingBuffer::new(256);
        src.put(b"@A\nACGT\n+\n!!!!\n@B\nTTTT\n+\n####\n").unwrap();
        let mut framer = Framer::new(Role::Inlet);
        let mut diags = Vec::new();
        // sink with room for exactly one record
        let mut out = Collector::new(16);

        framer.run(&mut src, &mut diags, |s, n| out.deliver(s, n)).unwrap();

        assert_eq!(out.sink.contiguous_filled(), b"@A\nACGT\n+\n!!!!\n");
        assert_eq!(src.contiguous_filled(), b"@B\nTTTT\n+\n####\n");
    }
}
