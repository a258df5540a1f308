use std::sync::Arc;

use futures::{
    FutureExt, TryFutureExt,
    future::{BoxFuture, Shared},
};

use crate::{Error, Result};

/// A memoised future every caller can clone and await. The wrapped work runs
/// once; all awaiting callers observe the same output.
pub type Flight<T> = Shared<BoxFuture<'static, core::result::Result<T, Arc<Error>>>>;

pub fn flight<T, F>(work: F) -> Flight<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    work.map_err(Arc::new).boxed().shared()
}
