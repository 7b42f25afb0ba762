use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Device allocator could not satisfy a request.
    #[snafu(display("out of memory on {device}: requested {requested} bytes, {available} available"))]
    OutOfMemory { device: String, requested: usize, available: usize },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    #[snafu(display("invalid registry configuration: {reason}"))]
    InvalidConfig { reason: String },

    /// Work was submitted to a queue that is shutting down.
    #[snafu(display("queue {queue} is shut down"))]
    QueueShutdown { queue: String },

    /// Failed to start the worker thread backing an asynchronous queue.
    #[snafu(display("failed to spawn worker for queue {queue}: {source}"))]
    SpawnWorker { queue: String, source: std::io::Error },

    /// A dispatched kernel reported a failure.
    #[snafu(display("kernel {name} failed: {reason}"))]
    Kernel { name: String, reason: String },

    #[snafu(display("kernel {name} panicked: {message}"))]
    KernelPanicked { name: String, message: String },

    /// Asynchronous work on a queue failed; reported at the next drain.
    #[snafu(display("queue {queue} failed: {source}"))]
    QueueFailed {
        queue: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
}
