/// Startup parameters for the balancer, shared by every worker thread.
///
/// Constructed once by the CLI (or by tests) and handed by value into
/// [`crate::worker::run`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub client_port: u16,
    pub backend_port: u16,
    pub workers: usize,
    /// Rows per pool chunk. See [`crate::pool`] for the chunked layout.
    pub chunk_capacity: usize,
    /// Max accepts drained per listener readiness wakeup.
    pub accept_burst: usize,
    /// Max datagrams drained per UDP readiness wakeup.
    pub udp_burst: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_port: 7878,
            backend_port: 7879,
            workers: 4,
            chunk_capacity: 20,
            accept_burst: 1,
            udp_burst: 1,
        }
    }
}
