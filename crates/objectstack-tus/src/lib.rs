//! Resumable upload subsystem for ObjectStack.
//!
//! Implements the server-side machinery behind the resumable upload
//! protocol (POST create, PATCH append, HEAD status, DELETE abort;
//! OPTIONS is handler-only):
//!
//! - [`UploadId`]: `{tenant}/{bucket}/{objectName}/{version}` ids,
//!   base64url-encoded in URLs.
//! - [`UploadLocker`]: distributed mutual exclusion per upload id, with a
//!   Postgres advisory-lock variant and a blob-backend conditional-put
//!   variant, coordinated through the lock-release channel.
//! - [`TusLifecycle`]: the create/append/status/abort state machine,
//!   delegating object lifecycle to the storage uploader.
//!
//! Protocol headers (`Tus-Resumable`, `Upload-Offset`, ...) belong to the
//! HTTP layer; nothing here parses or emits them.

mod info;
mod lifecycle;
mod locker;
mod upload_id;

pub use info::{StoredPart, UploadInfo};
pub use lifecycle::{CreateUpload, FinishedUpload, TusLifecycle};
pub use locker::{
    PgUploadLocker, S3UploadLocker, UploadLock, UploadLocker, sweep_expired_locks,
};
pub use upload_id::UploadId;
