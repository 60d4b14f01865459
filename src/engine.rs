// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! High-level PKC engine API.

use crate::device::Device;
use crate::dispatch::{Completion, JobStatus};
use crate::error::{PkcError, PkcResult};
use crate::layout::Operand;
use crate::request::{
    DhRequest, DsaKeygenRequest, DsaSignRequest, DsaVerifyRequest, PkcRequest,
    RsaPrivateRequest, RsaPublicRequest,
};
use crate::selector::DeviceSet;
use crate::submit::Submitted;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// High-level engine spreading jobs over a set of accelerators.
///
/// `Engine` picks a live device for every job, submits it on one of that
/// device's application rings and lets the caller drive completions with
/// [`Engine::poll`]. The blocking helpers (`sign`, `verify`, ...) do the
/// polling themselves.
///
/// # Example
///
/// ```rust,no_run
/// use pkc_accel::{DeviceConfig, DsaDomain, DsaSignRequest, Emulator, Engine, PkcError};
///
/// fn main() -> Result<(), PkcError> {
///     let config = DeviceConfig::new(0);
///     let emulator = Emulator::for_config(&config)?;
///     emulator.set_auto_process(true);
///     let engine = Engine::from_devices(vec![emulator.attach_device(config)?]);
///     engine.initialize_all()?;
///
///     let (c, d) = engine.sign(DsaSignRequest {
///         domain: DsaDomain::finite(vec![0xf1; 128], vec![0xe2; 20], vec![0xd3; 128]),
///         priv_key: vec![0x11; 20],
///         message: vec![0x22; 20],
///         component_len: 20,
///     })?;
///     println!("c={:02x?} d={:02x?}", c, d);
///     Ok(())
/// }
/// ```
pub struct Engine {
    devices: DeviceSet,
    timeout: Duration,
    poll_interval: Duration,
}

impl Engine {
    /// Default wait budget of the blocking helpers.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new(devices: DeviceSet) -> Self {
        Self {
            devices,
            timeout: Self::DEFAULT_TIMEOUT,
            poll_interval: Duration::from_micros(10),
        }
    }

    pub fn from_devices(devices: Vec<Arc<Device>>) -> Self {
        Self::new(DeviceSet::new(devices))
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set how long the blocking helpers wait for a completion.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause between polls of the blocking helpers.
    pub fn set_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = interval;
        self
    }

    /// Run the handshake on every device not yet alive.
    ///
    /// A device that fails stays dead and is skipped from then on. Fails
    /// only when no device at all came up.
    pub fn initialize_all(&self) -> PkcResult<usize> {
        if self.devices.is_empty() {
            return Err(PkcError::NoDeviceFound);
        }
        for device in self.devices.devices() {
            if device.is_alive() {
                continue;
            }
            if let Err(e) = device.initialize() {
                log::warn!("device {} failed to initialize: {}", device.id(), e);
            }
        }
        match self.devices.alive_count() {
            0 => Err(PkcError::NoDeviceAlive),
            alive => {
                log::info!("{} of {} devices ready", alive, self.devices.len());
                Ok(alive)
            }
        }
    }

    // ========================================================================
    // Asynchronous submission
    // ========================================================================

    /// Submit a job; `callback` runs once when its response is dispatched.
    ///
    /// On error the callback is dropped without being called.
    pub fn submit<F>(&self, req: impl Into<PkcRequest>, callback: F) -> PkcResult<Submitted>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let req = req.into();
        let device = self.devices.pick_device()?;
        device.submit(&req, Box::new(callback))
    }

    /// Dispatch pending responses of every device.
    ///
    /// Dead devices are still drained so their in-flight jobs complete.
    pub fn poll(&self) -> PkcResult<usize> {
        let mut total = 0;
        for device in self.devices.devices() {
            total += device.poll()?;
        }
        Ok(total)
    }

    /// Submit a job and return a future of its completion.
    ///
    /// The job is on a ring when this returns. The future resolves once some
    /// thread dispatches the response through [`Engine::poll`].
    #[cfg(feature = "async")]
    pub fn submit_async(
        &self,
        req: impl Into<PkcRequest>,
    ) -> PkcResult<impl std::future::Future<Output = PkcResult<Completion>> + Send + 'static> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(req, move |completion| {
            let _ = tx.send(completion);
        })?;
        Ok(async move { rx.await.map_err(|_| PkcError::JobDiscarded) })
    }

    // ========================================================================
    // Blocking helpers
    // ========================================================================

    /// Submit a job and poll its device until it completes.
    pub fn execute(&self, req: impl Into<PkcRequest>, timeout: Duration) -> PkcResult<Completion> {
        let (tx, rx) = mpsc::channel();
        let submitted = self.submit(req, move |completion| {
            let _ = tx.send(completion);
        })?;
        let device = self
            .devices
            .get(submitted.device)
            .ok_or(PkcError::DeviceNotReady(submitted.device))?;

        let deadline = Instant::now() + timeout;
        loop {
            device.process_responses(submitted.ring, usize::MAX)?;
            match rx.try_recv() {
                Ok(completion) => return Ok(completion),
                Err(TryRecvError::Disconnected) => return Err(PkcError::JobDiscarded),
                Err(TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "device {} ring {}: {} still outstanding after {:?}",
                    submitted.device,
                    submitted.ring,
                    submitted.token,
                    timeout
                );
                return Err(PkcError::WaitTimeout(timeout));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// DSA or ECDSA signature; returns `(c, d)`.
    pub fn sign(&self, req: DsaSignRequest) -> PkcResult<(Vec<u8>, Vec<u8>)> {
        let mut completion = succeeded(self.execute(req, self.timeout)?)?;
        let c = take_output(&mut completion, Operand::SigC)?;
        let d = take_output(&mut completion, Operand::SigD)?;
        Ok((c, d))
    }

    /// Returns false when the accelerator rejects the signature.
    pub fn verify(&self, req: DsaVerifyRequest) -> PkcResult<bool> {
        let completion = self.execute(req, self.timeout)?;
        match completion.status {
            JobStatus::Success => Ok(true),
            JobStatus::Failed(code) => {
                log::debug!("signature rejected with result {:#x}", code);
                Ok(false)
            }
            JobStatus::Discarded => Err(PkcError::JobDiscarded),
        }
    }

    /// Key pair generation; returns `(private, public)`.
    pub fn keygen(&self, req: DsaKeygenRequest) -> PkcResult<(Vec<u8>, Vec<u8>)> {
        let mut completion = succeeded(self.execute(req, self.timeout)?)?;
        let private = take_output(&mut completion, Operand::PrivKey)?;
        let public = take_output(&mut completion, Operand::PubKey)?;
        Ok((private, public))
    }

    /// DH or ECDH shared secret.
    pub fn dh(&self, req: DhRequest) -> PkcResult<Vec<u8>> {
        let mut completion = succeeded(self.execute(req, self.timeout)?)?;
        take_output(&mut completion, Operand::Secret)
    }

    pub fn rsa_public(&self, req: RsaPublicRequest) -> PkcResult<Vec<u8>> {
        let mut completion = succeeded(self.execute(req, self.timeout)?)?;
        take_output(&mut completion, Operand::RsaOut)
    }

    pub fn rsa_private(&self, req: RsaPrivateRequest) -> PkcResult<Vec<u8>> {
        let mut completion = succeeded(self.execute(req, self.timeout)?)?;
        take_output(&mut completion, Operand::RsaOut)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("devices", &self.devices)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn succeeded(completion: Completion) -> PkcResult<Completion> {
    match completion.status {
        JobStatus::Success => Ok(completion),
        JobStatus::Failed(code) => Err(PkcError::JobFailed { code }),
        JobStatus::Discarded => Err(PkcError::JobDiscarded),
    }
}

fn take_output(completion: &mut Completion, op: Operand) -> PkcResult<Vec<u8>> {
    let index = completion
        .outputs
        .iter()
        .position(|(o, _)| *o == op)
        .ok_or_else(|| PkcError::InvalidRequest(format!("{} produced no {}", completion.kind, op)))?;
    Ok(completion.outputs.swap_remove(index).1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::context::ContextToken;
    use crate::descriptor::DescHeader;
    use crate::emulator::{output_pattern, Emulator};
    use crate::layout::{CurveField, Group, OperationKind, RsaForm};
    use crate::request::{DsaDomain, RsaPrivateKey};

    fn config(id: u32) -> DeviceConfig {
        let mut config = DeviceConfig::new(id);
        config
            .set_rings(3, 16)
            .set_pool_size(32 * 1024)
            .set_context_capacity(32)
            .set_ob_dma_base(0x1_0000_0000);
        config
            .handshake_mut()
            .set_timeout(Duration::from_millis(5))
            .set_polls(5);
        config
    }

    fn engine(auto: bool) -> (Arc<Emulator>, Engine) {
        let emu = Emulator::for_config(&config(0)).unwrap();
        emu.set_auto_process(auto);
        let engine = Engine::from_devices(vec![emu.attach_device(config(0)).unwrap()]);
        assert_eq!(engine.initialize_all().unwrap(), 1);
        (emu, engine)
    }

    fn sign_request(q_len: usize, r_len: usize) -> DsaSignRequest {
        DsaSignRequest {
            domain: DsaDomain::finite(vec![0xf1; q_len], vec![0xe2; r_len], vec![0xd3; q_len]),
            priv_key: vec![0x11; r_len],
            message: vec![0x22; 32],
            component_len: r_len,
        }
    }

    #[test]
    fn test_dsa_sign_end_to_end() {
        let (emu, engine) = engine(true);
        let (c, d) = engine.sign(sign_request(20, 20)).unwrap();
        assert_eq!(c, output_pattern(Operand::SigC, 20));
        assert_eq!(d, output_pattern(Operand::SigD, 20));

        let descs = emu.descriptors();
        assert_eq!(descs.len(), 1);
        let desc = &descs[0];
        assert_eq!(desc.header, DescHeader::new(28, 16));
        let sig_c = desc.pointer(Operand::SigC).unwrap();
        assert_eq!(desc.pointer(Operand::SigD).unwrap(), sig_c + 20);

        let device = engine.devices().get(0).unwrap();
        assert_eq!(device.active_jobs(), 0);
        assert_eq!(device.stats().resp_count, 1);
    }

    #[test]
    fn test_other_families() {
        let (_emu, engine) = engine(true);

        let out = engine
            .rsa_public(RsaPublicRequest {
                n: vec![0xff; 128],
                e: vec![0x01, 0x00, 0x01],
                f: vec![0x42; 128],
            })
            .unwrap();
        assert_eq!(out, output_pattern(Operand::RsaOut, 128));

        let out = engine
            .rsa_private(RsaPrivateRequest {
                key: RsaPrivateKey::Form3 {
                    c: vec![0x01; 64],
                    p: vec![0x03; 64],
                    q: vec![0x05; 64],
                    dp: vec![0x07; 64],
                    dq: vec![0x09; 64],
                    n_len: 128,
                },
                g: vec![0x42; 128],
            })
            .unwrap();
        assert_eq!(out, output_pattern(Operand::RsaOut, 128));

        let domain = DsaDomain::curve(
            vec![0x0b; 24],
            vec![0x0d; 24],
            vec![0x0f; 48],
            vec![0x0a; 48],
            CurveField::Prime,
        );
        let (private, public) = engine
            .keygen(DsaKeygenRequest {
                domain,
                priv_len: 24,
                pub_len: 48,
            })
            .unwrap();
        assert_eq!(private, output_pattern(Operand::PrivKey, 24));
        assert_eq!(public, output_pattern(Operand::PubKey, 48));

        let secret = engine
            .dh(DhRequest {
                q: vec![0xfb; 128],
                curve: None,
                pub_key: vec![0x31; 128],
                priv_key: vec![0x17; 20],
                secret_len: 128,
            })
            .unwrap();
        assert_eq!(secret, output_pattern(Operand::Secret, 128));
    }

    #[test]
    fn test_verify_and_failures() {
        let (emu, engine) = engine(true);
        let verify = DsaVerifyRequest {
            domain: DsaDomain::finite(vec![0xf1; 20], vec![0xe2; 20], vec![0xd3; 20]),
            pub_key: vec![0x44; 20],
            message: vec![0x22; 32],
            c: vec![0x01; 20],
            d: vec![0x02; 20],
        };
        assert!(engine.verify(verify.clone()).unwrap());

        emu.set_result_code(0x86);
        assert!(!engine.verify(verify).unwrap());
        assert!(matches!(
            engine.sign(sign_request(20, 20)),
            Err(PkcError::JobFailed { code: 0x86 })
        ));

        emu.set_result_code(crate::dispatch::JOB_DISCARDED);
        assert!(matches!(
            engine.sign(sign_request(20, 20)),
            Err(PkcError::JobDiscarded)
        ));
        assert_eq!(engine.devices().get(0).unwrap().active_jobs(), 0);
    }

    #[test]
    fn test_execute_times_out() {
        let (_emu, engine) = engine(false);
        let err = engine
            .execute(sign_request(20, 20), Duration::from_millis(2))
            .unwrap_err();
        assert!(matches!(err, PkcError::WaitTimeout(_)));
        assert_eq!(engine.devices().get(0).unwrap().active_jobs(), 1);
    }

    #[test]
    fn test_out_of_order_completion() {
        let (emu, engine) = engine(false);
        emu.set_reverse(true);

        let (tx, rx) = mpsc::channel();
        let mut submitted = Vec::new();
        for i in 0..6usize {
            let tx = tx.clone();
            let job = engine
                .submit(sign_request(20, 20 + i), move |c: Completion| {
                    tx.send((i, c)).unwrap();
                })
                .unwrap();
            submitted.push(job);
        }
        assert_eq!(emu.process_all().unwrap(), 6);
        assert_eq!(engine.poll().unwrap(), 6);

        let mut seen: Vec<(usize, Completion)> = rx.try_iter().collect();
        assert_eq!(seen.len(), 6);
        // Reversed batches complete last-submitted first on each ring.
        assert_ne!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..6).collect::<Vec<_>>());

        seen.sort_by_key(|(i, _)| *i);
        let tokens: Vec<ContextToken> = seen.iter().map(|(_, c)| c.token).collect();
        for (i, completion) in seen {
            assert_eq!(completion.token, submitted[i].token);
            assert_eq!(completion.kind, OperationKind::DsaSign(Group::Finite));
            assert_eq!(
                completion.output(Operand::SigC).unwrap(),
                output_pattern(Operand::SigC, 20 + i)
            );
        }
        let mut unique = tokens.clone();
        unique.sort_by_key(|t| t.to_raw());
        unique.dedup();
        assert_eq!(unique.len(), tokens.len());
    }

    #[test]
    fn test_dead_device_is_not_picked() {
        let emu0 = Emulator::for_config(&config(0)).unwrap();
        let emu1 = Emulator::for_config(&config(1)).unwrap();
        emu1.set_drop_state(Some(crate::handshake::HandshakeState::FirmwareUp));
        emu0.set_auto_process(true);

        let engine = Engine::from_devices(vec![
            emu0.attach_device(config(0)).unwrap(),
            emu1.attach_device(config(1)).unwrap(),
        ]);
        assert_eq!(engine.initialize_all().unwrap(), 1);
        for _ in 0..3 {
            let job = engine.submit(sign_request(20, 20), |_: Completion| {}).unwrap();
            assert_eq!(job.device, 0);
        }
        assert_eq!(engine.poll().unwrap(), 3);
    }

    #[test]
    fn test_rsa_form_reported() {
        let (_emu, engine) = engine(true);
        let completion = engine
            .execute(
                RsaPrivateRequest {
                    key: RsaPrivateKey::Form1 {
                        n: vec![0xff; 64],
                        d: vec![0x35; 64],
                    },
                    g: vec![0x42; 64],
                },
                Duration::from_millis(100),
            )
            .unwrap();
        assert_eq!(completion.kind, OperationKind::RsaPrivate(RsaForm::Form1));
        assert!(completion.is_success());
    }

    #[cfg(feature = "async")]
    #[test]
    fn test_submit_async() {
        let (_emu, engine) = engine(true);
        let future = engine.submit_async(sign_request(20, 20)).unwrap();
        assert_eq!(engine.poll().unwrap(), 1);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let completion = runtime.block_on(future).unwrap();
        assert!(completion.is_success());
        assert_eq!(
            completion.output(Operand::SigD).unwrap(),
            output_pattern(Operand::SigD, 20)
        );
    }
}
