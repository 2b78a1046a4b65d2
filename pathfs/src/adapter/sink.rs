/// Consumer of directory entries fed by [`Adapter::readdir`](super::Adapter::readdir).
pub trait DirSink {
    /// Accept one entry name. Returning `false` means the sink is full and nothing more
    /// should be pushed during this call.
    fn push(&mut self, name: &str) -> bool;
}

/// Unbounded sink collecting every name.
impl DirSink for Vec<String> {
    fn push(&mut self, name: &str) -> bool {
        Vec::push(self, name.to_owned());
        true
    }
}
