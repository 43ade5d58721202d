/*!
# Turntable Scanner

Orchestrates a camera and a motorized turntable owned by a separate hardware
worker process, capturing one full-rotation image sequence per scan.

## Layers

- [`codec`] - newline-delimited JSON framing and request/response correlation
- [`camera`] / [`stage`] - typed device proxies over the codec
- [`orchestrator`] - the initialize / scan / cleanup state machine
- [`listeners`] - subscription registry with disposer handles
- [`persistence`] - scan record repositories
- [`worker`] / [`sim`] - real child-process worker and in-process simulator
- [`config`] - TOML application configuration
*/

pub mod camera;
pub mod codec;
pub mod config;
pub mod listeners;
pub mod orchestrator;
pub mod persistence;
pub mod sim;
pub mod stage;
pub mod worker;

pub use codec::Codec;
pub use listeners::{EventRegistry, Subscription};
pub use orchestrator::Orchestrator;
pub use persistence::{InMemoryScanRepository, JsonlScanRepository, ScanRepository};
