/// Decides whether a client key may log in.
///
/// Implementations are shared by every connection, so they must be cheap to clone.
pub trait KeyAuthorizer<KEY>: Clone + Send + Sync + 'static {
    fn authorize(&self, user: &str, key: &KEY) -> bool;
}
