// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example: bring up an emulated accelerator and run a few jobs.
//!
//! Run with: `cargo run --example basic`

use pkc_accel::emulator::TraceEvent;
use pkc_accel::{
    Completion, DeviceConfig, DsaDomain, DsaSignRequest, DsaVerifyRequest, Emulator, Engine,
    RsaPublicRequest,
};

fn main() {
    println!("PKC Accelerator Basic Example");
    println!("=============================\n");

    let mut config = DeviceConfig::new(0);
    config.set_rings(3, 32).set_ob_dma_base(0x1_0000_0000);

    let emulator = match Emulator::for_config(&config) {
        Ok(emulator) => emulator,
        Err(e) => {
            println!("  Failed to create emulator: {}", e);
            return;
        }
    };
    emulator.set_auto_process(true);

    // Bring-up
    println!("Attaching device 0...");
    let device = match emulator.attach_device(config) {
        Ok(device) => device,
        Err(e) => {
            println!("  Attach failed: {}", e);
            return;
        }
    };
    let engine = Engine::from_devices(vec![device.clone()]);
    match engine.initialize_all() {
        Ok(alive) => println!("  {} device(s) ready", alive),
        Err(e) => {
            println!("  Handshake failed: {}", e);
            return;
        }
    }
    if let Some(info) = device.info() {
        println!("  Engines: {}", info.no_secs);
        println!("  Request rings: {:x?}", info.req_rings);
    }
    for event in emulator.trace() {
        if let TraceEvent::Command { cmd, data } = event {
            println!("    command {:#04x} {:x?}", cmd, data);
        }
    }
    println!();

    // DSA sign
    println!("Signing with DSA (q=128 bytes, r=20 bytes)...");
    let domain = DsaDomain::finite(vec![0xf1; 128], vec![0xe2; 20], vec![0xd3; 128]);
    let sign = DsaSignRequest {
        domain: domain.clone(),
        priv_key: vec![0x11; 20],
        message: vec![0x22; 20],
        component_len: 20,
    };
    let (c, d) = match engine.sign(sign) {
        Ok(sig) => sig,
        Err(e) => {
            println!("  Sign failed: {}", e);
            return;
        }
    };
    println!("  c = {:02x?}", c);
    println!("  d = {:02x?}", d);
    if let Some(desc) = emulator.descriptors().last() {
        println!(
            "  descriptor: {} words, start index {}",
            desc.header.len, desc.header.start
        );
    }
    println!();

    // DSA verify
    println!("Verifying the signature...");
    let verify = DsaVerifyRequest {
        domain,
        pub_key: vec![0x33; 128],
        message: vec![0x22; 20],
        c,
        d,
    };
    match engine.verify(verify) {
        Ok(valid) => println!("  valid: {}", valid),
        Err(e) => println!("  Verify failed: {}", e),
    }
    println!();

    // Callback style
    println!("Submitting RSA-2048 public jobs with callbacks...");
    for i in 0..4 {
        let req = RsaPublicRequest {
            n: vec![0xff; 256],
            e: vec![0x01, 0x00, 0x01],
            f: vec![i as u8; 256],
        };
        let result = engine.submit(req, move |c: Completion| {
            println!("  job {} done: {} after {:?}", i, c.status, c.latency);
        });
        if let Err(e) = result {
            println!("  Submit {} failed: {}", i, e);
        }
    }
    match engine.poll() {
        Ok(n) => println!("  dispatched {} completions", n),
        Err(e) => println!("  Poll failed: {}", e),
    }
    println!();

    println!("Stats: {}", device.stats());
    println!("Done!");
}
