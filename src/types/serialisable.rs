/// Types implementing WireSerialisable can be sent over the datagram link to
/// the remote service (commands) or back from it (responses, in test doubles).
pub trait WireSerialisable {
    /// Converts the value in question to its on-the-wire bytes.
    fn serialise_wire(&self) -> Vec<u8>;
}
