//! Resume checks: can a stored breakpoint be continued?

use crate::breakpoint::BreakpointInfo;
use crate::error::{DownloadError, DownloadResult};
use crate::output::OutputBackend;
use crate::task::{DownloadTask, ResumeFailedCause};

/// Checks the stored breakpoint against the local file system.
pub fn local_check(
    task: &DownloadTask,
    info: &BreakpointInfo,
    backend: &dyn OutputBackend,
) -> Result<(), ResumeFailedCause> {
    let blocks = info.blocks();
    let info_right = !blocks.is_empty()
        && !info.is_chunked()
        && blocks
            .iter()
            .all(|b| !b.is_chunked() && b.content_length() > 0);
    let path = info.path().filter(|p| Some(p) == task.path().as_ref());

    let Some(path) = path.filter(|_| info_right) else {
        return Err(ResumeFailedCause::InfoDirty);
    };
    if !backend.exists(&path) {
        return Err(ResumeFailedCause::FileNotExist);
    }

    let pre_allocate = task
        .pre_allocate()
        .unwrap_or_else(|| backend.supports_seek());
    let output_support = backend.supports_seek() || (blocks.len() == 1 && !pre_allocate);
    if !output_support {
        return Err(ResumeFailedCause::OutputStreamNotSupport);
    }
    Ok(())
}

/// Validates a block's response before its body is used.
///
/// `requested_offset` is the absolute byte the request asked to start from.
pub fn response_check(
    status: u16,
    stored_etag: Option<&str>,
    response_etag: Option<&str>,
    requested_offset: u64,
) -> DownloadResult<()> {
    let resume_failed = |cause| Err(DownloadError::ResumeFailed(cause));

    if status == 412 {
        return resume_failed(ResumeFailedCause::ResponsePreconditionFailed);
    }
    if let (Some(stored), Some(received)) = (stored_etag, response_etag) {
        if stored != received {
            return resume_failed(ResumeFailedCause::ResponseEtagChanged);
        }
    }
    if status == 201 && requested_offset != 0 {
        return resume_failed(ResumeFailedCause::ResponseCreatedRangeNotFrom0);
    }
    if status == 205 && requested_offset != 0 {
        return resume_failed(ResumeFailedCause::ResponseResetRangeNotFrom0);
    }
    if (status != 206 && status != 200) || (status == 200 && requested_offset != 0) {
        return Err(DownloadError::ServerCanceled {
            status,
            current_offset: requested_offset,
        });
    }
    Ok(())
}
