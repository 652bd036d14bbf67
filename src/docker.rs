//! Docker client construction.

use bollard::Docker;

/// Connect to the daemon using the default method (Unix socket on
/// Linux/macOS, named pipe on Windows, or `DOCKER_HOST` when set).
pub fn connect() -> Result<Docker, bollard::errors::Error> {
    Docker::connect_with_local_defaults()
}
