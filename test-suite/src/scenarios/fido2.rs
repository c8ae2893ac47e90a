// Licensed under the Apache-2.0 license

//! WebAuthn registration and authentication for `example.com`, plus the
//! `nitropy fido2` credential management of resident keys.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context, Result};
use authenticator::authenticatorservice::{AuthenticatorService, RegisterArgs, SignArgs};
use authenticator::crypto::COSEAlgorithm;
use authenticator::ctap2::attestation::{AttestationStatement, AuthenticatorDataFlags};
use authenticator::ctap2::server::{
    PublicKeyCredentialDescriptor, PublicKeyCredentialParameters, PublicKeyCredentialUserEntity,
    RelyingParty, ResidentKeyRequirement, Transport, UserVerificationRequirement,
};
use authenticator::errors::AuthenticatorError;
use authenticator::statecallback::StateCallback;
use authenticator::{Pin, RegisterResult, SignResult, StatusPinUv, StatusUpdate};
use log::{debug, info};
use nitrokey_hil_hw_model::expect::Session;
use nitrokey_hil_hw_model::{Device, UpgradeTest};

use crate::harness::{Module, TestBody, TestCase};
use crate::scenarios::random_pin;

const RP_ID: &str = "example.com";
const RP_NAME: &str = "Example RP";
const ORIGIN: &str = "https://example.com";
const USER_ID: &[u8] = b"user_id";
const USER_NAME: &str = "A. User";

const TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A credential registered for [`RP_ID`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub id: Vec<u8>,
}

impl Credential {
    pub fn hex_id(&self) -> String {
        hex::encode(&self.id)
    }

    fn descriptor(&self) -> PublicKeyCredentialDescriptor {
        PublicKeyCredentialDescriptor {
            id: self.id.clone(),
            transports: vec![Transport::USB],
        }
    }
}

/// A WebAuthn client talking to the device over USB HID.
pub struct Client<'a> {
    device: &'a mut Device,
    service: AuthenticatorService,
    status_tx: Sender<StatusUpdate>,
    status_rx: Receiver<StatusUpdate>,
}

impl<'a> Client<'a> {
    pub fn new(device: &'a mut Device) -> Result<Self> {
        let mut service =
            AuthenticatorService::new().map_err(|e| anyhow!("authenticator service: {e:?}"))?;
        service.add_u2f_usb_hid_platform_transports();
        let (status_tx, status_rx) = channel();
        Ok(Self {
            device,
            service,
            status_tx,
            status_rx,
        })
    }

    pub fn device(&mut self) -> &mut Device {
        &mut *self.device
    }

    fn pin(&self) -> Option<Pin> {
        self.device.pin().map(|pin| Pin::new(&pin))
    }

    /// Registers [`USER_NAME`], as a resident key if `resident` is set. The
    /// device has to present an attestation certificate.
    pub fn register(&mut self, resident: bool) -> Result<Credential> {
        let (user_verification_req, resident_key_req) = if resident {
            (
                UserVerificationRequirement::Preferred,
                ResidentKeyRequirement::Required,
            )
        } else {
            (
                UserVerificationRequirement::Discouraged,
                ResidentKeyRequirement::Discouraged,
            )
        };
        let args = RegisterArgs {
            client_data_hash: rand::random(),
            relying_party: RelyingParty {
                id: RP_ID.into(),
                name: Some(RP_NAME.into()),
            },
            origin: ORIGIN.into(),
            user: PublicKeyCredentialUserEntity {
                id: USER_ID.to_vec(),
                name: Some(USER_NAME.into()),
                display_name: None,
            },
            pub_cred_params: vec![
                PublicKeyCredentialParameters {
                    alg: COSEAlgorithm::ES256,
                },
                PublicKeyCredentialParameters {
                    alg: COSEAlgorithm::EDDSA,
                },
            ],
            exclude_list: vec![],
            user_verification_req,
            resident_key_req,
            extensions: Default::default(),
            pin: self.pin(),
            use_ctap1_fallback: false,
        };

        let (result_tx, result_rx) = channel();
        let callback = StateCallback::new(Box::new(move |rv| {
            let _ = result_tx.send(rv);
        }));
        self.service
            .register(
                TIMEOUT.as_millis() as u64,
                args,
                self.status_tx.clone(),
                callback,
            )
            .map_err(|e| anyhow!("failed to start registration: {e:?}"))?;
        let RegisterResult { att_obj, .. } = self
            .wait(&result_rx)
            .map_err(|e| e.context("registration failed"))?;

        ensure!(
            matches!(&att_obj.att_stmt, AttestationStatement::Packed(s) if !s.attestation_cert.is_empty()),
            "no attestation certificate in the attestation statement"
        );
        let credential_data = att_obj
            .auth_data
            .credential_data
            .context("no credential data in the attestation object")?;
        let credential = Credential {
            id: credential_data.credential_id,
        };
        info!("registered credential {}", credential.hex_id());
        Ok(credential)
    }

    /// Authenticates with one of `credentials`.
    pub fn authenticate(&mut self, credentials: &[Credential]) -> Result<()> {
        let args = SignArgs {
            client_data_hash: rand::random(),
            origin: ORIGIN.into(),
            relying_party_id: RP_ID.into(),
            allow_list: credentials.iter().map(Credential::descriptor).collect(),
            user_verification_req: UserVerificationRequirement::Discouraged,
            user_presence_req: true,
            extensions: Default::default(),
            pin: self.pin(),
            use_ctap1_fallback: false,
        };

        let (result_tx, result_rx) = channel();
        let callback = StateCallback::new(Box::new(move |rv| {
            let _ = result_tx.send(rv);
        }));
        self.service
            .sign(
                TIMEOUT.as_millis() as u64,
                args,
                self.status_tx.clone(),
                callback,
            )
            .map_err(|e| anyhow!("failed to start authentication: {e:?}"))?;
        let SignResult { assertion, .. } = self
            .wait(&result_rx)
            .map_err(|e| e.context("authentication failed"))?;

        check_assertion(
            credentials,
            assertion.credentials.as_ref().map(|c| c.id.as_slice()),
            assertion
                .auth_data
                .flags
                .contains(AuthenticatorDataFlags::USER_PRESENT),
            &assertion.signature,
        )
    }

    /// Serves status updates until the service delivers its result.
    fn wait<T>(&mut self, result_rx: &Receiver<Result<T, AuthenticatorError>>) -> Result<T> {
        let deadline = Instant::now() + TIMEOUT + POLL_INTERVAL * 10;
        loop {
            match result_rx.try_recv() {
                Ok(result) => return result.map_err(|e| anyhow!("{e:?}")),
                Err(TryRecvError::Disconnected) => bail!("authenticator service dropped the request"),
                Err(TryRecvError::Empty) => {}
            }
            ensure!(Instant::now() < deadline, "no response from the authenticator");
            match self.status_rx.recv_timeout(POLL_INTERVAL) {
                Ok(update) => self.handle_status(update)?,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }
    }

    fn handle_status(&mut self, update: StatusUpdate) -> Result<()> {
        match update {
            StatusUpdate::PresenceRequired => {
                debug!("user presence required");
                if self.device.user_presence() {
                    self.device.confirm_user_presence()?;
                }
            }
            StatusUpdate::PinUvError(StatusPinUv::PinRequired(sender)) => {
                let pin = self
                    .pin()
                    .context("the device asks for a PIN, but none is set")?;
                sender
                    .send(pin)
                    .map_err(|_| anyhow!("failed to hand the PIN to the authenticator"))?;
            }
            StatusUpdate::PinUvError(_) => bail!("the device rejected the PIN"),
            _ => {}
        }
        Ok(())
    }
}

fn check_assertion(
    allowed: &[Credential],
    credential_id: Option<&[u8]>,
    user_present: bool,
    signature: &[u8],
) -> Result<()> {
    if let Some(id) = credential_id {
        ensure!(
            allowed.iter().any(|c| c.id == id),
            "assertion for unknown credential {}",
            hex::encode(id)
        );
    } else {
        // may only be omitted if there is a single candidate
        ensure!(allowed.len() == 1, "assertion without credential id");
    }
    ensure!(user_present, "user presence flag not set");
    ensure!(!signature.is_empty(), "empty assertion signature");
    Ok(())
}

/// The `nitropy fido2` credential management commands.
#[derive(Clone, Debug)]
pub struct CredentialCommand {
    pub list: Vec<String>,
    pub delete: Vec<String>,
}

impl Default for CredentialCommand {
    fn default() -> Self {
        Self {
            list: ["nitropy", "fido2", "list-credentials"]
                .map(String::from)
                .to_vec(),
            delete: ["nitropy", "fido2", "delete-credential"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl CredentialCommand {
    fn spawn(argv: &[String]) -> Result<Session> {
        let (program, args) = argv.split_first().context("empty command")?;
        Ok(Session::spawn(program, args)?)
    }

    /// Checks that `credential` is listed for [`USER_NAME`].
    pub fn expect_listed(&self, pin: &str, credential: &Credential) -> Result<()> {
        let mut p = Self::spawn(&self.list)?;
        p.expect("provide pin")?;
        p.send_line(pin)?;
        p.expect(&format!("id: {}", credential.hex_id()))?;
        p.expect(&format!("user: {USER_NAME}"))?;
        Ok(())
    }

    pub fn delete(&self, pin: &str, credential: &Credential) -> Result<()> {
        let mut p = Self::spawn(&self.delete)?;
        p.expect("provide credential-id")?;
        p.send_line(&credential.hex_id())?;
        p.expect("provide pin")?;
        p.send_line(pin)?;
        p.expect("successfully deleted")?;
        Ok(())
    }
}

/// Registers a credential and authenticates with it.
#[derive(Default)]
pub struct Fido2;

impl UpgradeTest for Fido2 {
    type Context<'a> = Client<'a>;
    type State = Credential;

    fn name(&self) -> String {
        "fido2".into()
    }

    fn context<'a>(&self, device: &'a mut Device) -> Result<Client<'a>> {
        Client::new(device)
    }

    fn prepare(&self, client: &mut Client<'_>) -> Result<Credential> {
        client.register(false)
    }

    fn verify(&self, client: &mut Client<'_>, credential: Credential) -> Result<()> {
        client.authenticate(&[credential])
    }
}

/// Registers a PIN protected resident key, authenticates with it and
/// removes it again with `nitropy`.
pub struct Fido2Resident {
    pin: String,
    commands: CredentialCommand,
}

impl Default for Fido2Resident {
    fn default() -> Self {
        Self {
            pin: random_pin(),
            commands: CredentialCommand::default(),
        }
    }
}

impl UpgradeTest for Fido2Resident {
    type Context<'a> = Client<'a>;
    type State = Credential;

    fn name(&self) -> String {
        "fido2_resident".into()
    }

    fn context<'a>(&self, device: &'a mut Device) -> Result<Client<'a>> {
        Client::new(device)
    }

    fn prepare(&self, client: &mut Client<'_>) -> Result<Credential> {
        client.device().set_pin(&self.pin)?;
        client.register(true)
    }

    fn verify(&self, client: &mut Client<'_>, credential: Credential) -> Result<()> {
        client.authenticate(std::slice::from_ref(&credential))?;
        self.commands.expect_listed(&self.pin, &credential)?;
        self.commands.delete(&self.pin, &credential)
    }
}

fn touch_test<T: UpgradeTest + 'static>(test: T) -> TestCase {
    TestCase::new(
        test.name(),
        &[],
        TestBody::TouchDevice(Box::new(move |device: &mut Device| test.run(device))),
    )
}

/// The FIDO2 tests on a device that waits for user presence.
pub fn touch_module() -> Module {
    Module::new(
        "touch",
        vec![
            touch_test(Fido2),
            touch_test(Fido2Resident::default()),
        ],
    )
}
