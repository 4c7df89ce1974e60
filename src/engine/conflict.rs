use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Fields of a draft that passed validation, ready to become a request.
pub(crate) struct ValidDraft {
    pub resource_id: Ulid,
    pub owner_id: Ulid,
    pub group_id: Ulid,
    pub span: Span,
    pub title: String,
    pub description: Option<String>,
    pub reason: Option<String>,
}

/// Required-field and shape checks. Referential checks happen in the engine.
pub(crate) fn validate_draft(draft: RequestDraft) -> Result<ValidDraft, EngineError> {
    let resource_id = draft.resource_id.ok_or(EngineError::missing("resource_id"))?;
    let owner_id = draft.owner_id.ok_or(EngineError::missing("owner_id"))?;
    let group_id = draft.group_id.ok_or(EngineError::missing("group_id"))?;
    let start = draft.start.ok_or(EngineError::missing("start_time"))?;
    let end = draft.end.ok_or(EngineError::missing("end_time"))?;
    let title = draft
        .title
        .filter(|t| !t.trim().is_empty())
        .ok_or(EngineError::missing("title"))?;

    if start >= end {
        return Err(EngineError::Validation {
            field: "end_time",
            reason: "must be after start_time",
        });
    }
    let span = Span::new(start, end);
    validate_span(&span)?;

    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if draft
        .description
        .as_ref()
        .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if draft.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::LimitExceeded("reason too long"));
    }

    Ok(ValidDraft {
        resource_id,
        owner_id,
        group_id,
        span,
        title,
        description: draft.description,
        reason: draft.reason,
    })
}

/// Pending requests may share a slot; a confirmed one may not be overlapped.
pub(crate) fn check_no_confirmed_conflict(
    rs: &ResourceState,
    span: &Span,
    except: Option<Ulid>,
) -> Result<(), EngineError> {
    match rs.confirmed_overlap(span, except) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
