use crate::error::RemoteError;
use crate::types::ObjectRecord;

/// One page of the remote listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectRecord>,
    pub next_token: Option<String>,
}

/// A single per-object request carried inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRequest {
    Metadata(String),
    Trash(String),
}

impl BatchRequest {
    pub fn id(&self) -> &str {
        match self {
            BatchRequest::Metadata(id) | BatchRequest::Trash(id) => id,
        }
    }
}

/// Successful per-item outcome of a batch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchReply {
    Metadata(ObjectRecord),
    Trashed,
}

/// Blocking access to the remote object store.
///
/// `batch` returns `Err` only when the whole batch could not be delivered;
/// otherwise it yields exactly one outcome per request, in request order.
pub trait RemoteTransport {
    fn list_page(&self, page_token: Option<&str>) -> Result<ListPage, RemoteError>;

    fn get(&self, id: &str) -> Result<ObjectRecord, RemoteError>;

    fn batch(
        &self,
        requests: &[BatchRequest],
    ) -> Result<Vec<Result<BatchReply, RemoteError>>, RemoteError>;

    fn trash(&self, id: &str) -> Result<(), RemoteError>;
}
