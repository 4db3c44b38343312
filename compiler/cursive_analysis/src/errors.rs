use std::fmt;

use cursive_ast::span::Span;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AnalysisError {
    pub span: Span,
    pub kind: AnalysisErrorKind,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AnalysisErrorKind {
    UseAfterMove { name: String },
    UseOfMovedField { name: String, field: String },
    MoveOfImmovable { name: String },
    /// Responsibility cannot be taken out of an alias binding.
    MoveFromAlias { name: String },
    UnknownBinding { name: String },
    /// A state-specific operation applied to a general-state modal value.
    StateRequired { name: String, method: String },
    StateMismatch { expected: String, found: String },
    FrameOutsideRegion,
    UnknownRegion { name: String },
    AllocOutsideRegion,
    PointerOutlivesRegion { name: String },
    KeyConflict { held: String, requested: String },
    BadMainSignature,
    ContextAcrossFfi { proc: String },
}

impl AnalysisError {
    pub fn new(span: Span, kind: AnalysisErrorKind) -> AnalysisError {
        AnalysisError { span, kind }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AnalysisErrorKind::UseAfterMove { name } => {
                write!(f, "use of moved binding `{}`", name)
            }
            AnalysisErrorKind::UseOfMovedField { name, field } => {
                write!(f, "use of `{}` whose field `{}` was moved", name, field)
            }
            AnalysisErrorKind::MoveOfImmovable { name } => {
                write!(f, "cannot move immovable binding `{}`", name)
            }
            AnalysisErrorKind::MoveFromAlias { name } => {
                write!(f, "cannot move out of alias binding `{}`", name)
            }
            AnalysisErrorKind::UnknownBinding { name } => {
                write!(f, "unknown binding `{}`", name)
            }
            AnalysisErrorKind::StateRequired { name, method } => {
                write!(f, "method `{}` needs a state-specialized receiver, `{}` is general", method, name)
            }
            AnalysisErrorKind::StateMismatch { expected, found } => {
                write!(f, "modal state mismatch: expected @{}, found @{}", expected, found)
            }
            AnalysisErrorKind::FrameOutsideRegion => {
                f.write_str("frame block outside any region")
            }
            AnalysisErrorKind::UnknownRegion { name } => {
                write!(f, "no region named `{}` in scope", name)
            }
            AnalysisErrorKind::AllocOutsideRegion => {
                f.write_str("alloc requires an active region")
            }
            AnalysisErrorKind::PointerOutlivesRegion { name } => {
                write!(f, "pointer `{}` outlives the region it points into", name)
            }
            AnalysisErrorKind::KeyConflict { held, requested } => {
                write!(f, "key `{}` conflicts with held key `{}`", requested, held)
            }
            AnalysisErrorKind::BadMainSignature => {
                f.write_str("`main` must be `(move ctx: Context) -> i32`")
            }
            AnalysisErrorKind::ContextAcrossFfi { proc } => {
                write!(f, "`Context` is not FFI-safe and cannot reach extern `{}`", proc)
            }
        }
    }
}
