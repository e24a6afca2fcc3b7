//! Shared fixtures: one provisioned AP with components on a loopback bus.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use trustbus::config::BusConfig;
use trustbus::protocol::attestation::AttestationReport;
use trustbus::transport::Responder;
use trustbus::utils::console::{Console, ConsoleLine};
use trustbus::utils::keystore::{Deployment, DeploymentParams, FlashStore};
use trustbus::{ApplicationProcessor, BusAddress, Component, LoopbackBus};

pub const COMPONENT_A: u32 = 0x1111_1124;
pub const COMPONENT_B: u32 = 0x1111_1125;
pub const PIN: &str = "123456";
pub const TOKEN: &str = "0123456789abcdef";
pub const AP_BOOT_MESSAGE: &str = "AP booted";
pub const COMPONENT_BOOT_MESSAGE: &str = "Component booted";

pub type TestAp<R = Component> = ApplicationProcessor<LoopbackBus<R>, Vec<u8>>;

pub fn report() -> AttestationReport {
    AttestationReport::new("Lab 4", "2024-05-01", "ACME").unwrap()
}

pub fn deployment() -> Deployment {
    Deployment::generate(&DeploymentParams {
        pin: PIN,
        token: TOKEN,
        report: &report(),
        ap_boot_message: AP_BOOT_MESSAGE,
        component_boot_message: COMPONENT_BOOT_MESSAGE,
    })
    .unwrap()
}

/// AP with `ids` provisioned and a component attached for each.
pub fn system(ids: &[u32]) -> TestAp {
    let deployment = deployment();
    let mut bus = LoopbackBus::new();
    for &id in ids {
        bus.attach(
            BusAddress::from_component_id(id),
            Component::from_secrets(id, &deployment.component).unwrap(),
        );
    }
    ap_over(bus, deployment, ids)
}

/// AP over any loopback bus, provisioned with `ids`.
pub fn ap_over<R: Responder>(
    bus: LoopbackBus<R>,
    deployment: Deployment,
    ids: &[u32],
) -> TestAp<R> {
    ApplicationProcessor::new(
        bus,
        deployment.ap,
        FlashStore::in_memory(ids),
        Console::new(Vec::new()),
        BusConfig::default(),
    )
    .unwrap()
}

pub fn component<R: Responder>(ap: &mut TestAp<R>, id: u32) -> &mut R {
    ap.bus_mut()
        .device_mut(BusAddress::from_component_id(id))
        .expect("component attached")
}

pub fn console_lines<R: Responder>(ap: &TestAp<R>) -> Vec<ConsoleLine> {
    String::from_utf8(ap.console().get_ref().clone())
        .unwrap()
        .lines()
        .map(|line| ConsoleLine::parse(line).expect("well-formed console line"))
        .collect()
}
