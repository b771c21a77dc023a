use crate::{
    context::FaultContext,
    report::{ReportWriter, WalkOutcome},
    symbols::{ResolvedFrame, SymbolResolver},
    walker::{FrameCursor, MemoryReader, RegisterKind, Step},
};

/// What a capture managed to record
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Number of frames written to the report
    pub frames: usize,
    pub outcome: WalkOutcome,
    /// False if the report could not be written out completely
    pub written: bool,
}

/// Walks the stack of `fault`, resolves every frame and writes the report.
///
/// Async-signal-safe as long as `memory` and `resolver` are. Frames that were
/// walked before the chain broke are always reported.
pub fn capture<M, R>(
    fault: &FaultContext,
    memory: &M,
    resolver: &R,
    max_frames: usize,
    writer: &mut ReportWriter,
) -> CaptureSummary
where
    M: MemoryReader,
    R: SymbolResolver + ?Sized,
{
    writer.header(fault.signal, fault.code, fault.address);

    let mut cursor = FrameCursor::new(memory, max_frames);
    let mut frames = 0;

    let outcome = if cursor.init(fault).is_err() {
        WalkOutcome::InvalidContext
    } else {
        loop {
            if let Ok(ip) = cursor.register(RegisterKind::InstructionPointer) {
                writer.frame(&ResolvedFrame::new(frames, ip, resolver.resolve(ip)));
                frames += 1;
            }

            match cursor.next() {
                Step::Ready => continue,
                Step::Exhausted if cursor.reached_limit() => break WalkOutcome::FrameLimit,
                Step::Exhausted => break WalkOutcome::Complete,
                Step::Corrupted => break WalkOutcome::Corrupted,
            }
        }
    };

    writer.footer(outcome);

    CaptureSummary {
        frames,
        outcome,
        written: writer.is_ok(),
    }
}
