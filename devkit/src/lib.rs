/*!
# FleetDeck DevKit - test support for the kernel

- An in-process control-plane stub with mutable deployments, failure
  injection and request recording
- JSON fixtures for cluster objects
- A harness that seeds the stub and renders a matching boot config
*/

pub mod control_plane_stub;
pub mod fixtures;
pub mod test_utils;

pub use control_plane_stub::ControlPlaneStub;
pub use test_utils::TestHarness;
