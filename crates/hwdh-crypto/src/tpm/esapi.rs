//! [`TpmModule`] over the TSS Enhanced System API (`tss-esapi`).

use super::{EccPoint, Hierarchy, KeyContext, PrimaryTemplate, TpmModule, TpmSession};
use crate::curve::Curve;
use crate::error::{DhError, Result};
use hwdh_common::config::AuthValue;
use std::collections::HashMap;
use std::str::FromStr;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::{KeyHandle, ObjectHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::Hierarchy as TssHierarchy;
use tss_esapi::structures::{
    Auth, EccParameter, EccPoint as TssEccPoint, EccScheme, KeyDerivationFunctionScheme, Public,
    PublicBuilder, PublicEccParametersBuilder, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::tss2_esys::ESYS_TR;
use tss_esapi::Context;

/// TPM reached through a TCTI such as `device:/dev/tpmrm0` or
/// `mssim:host=localhost,port=2321`.
#[derive(Debug, Clone)]
pub struct EsapiModule {
    tcti: String,
}

impl EsapiModule {
    pub fn new(tcti: &str) -> Self {
        Self {
            tcti: tcti.to_string(),
        }
    }
}

impl TpmModule for EsapiModule {
    fn open(&self) -> Result<Box<dyn TpmSession>> {
        let tcti = TctiNameConf::from_str(&self.tcti)
            .map_err(|e| {
                DhError::ModuleSession(format!("unable to open TPM: bad TCTI {:?}: {e}", self.tcti))
            })?;
        let context = Context::new(tcti)
            .map_err(|e| DhError::ModuleSession(format!("unable to open TPM: {e}")))?;
        tracing::debug!(tcti = %self.tcti, "opened TPM context");
        Ok(Box::new(EsapiSession {
            context: Some(context),
            publics: HashMap::new(),
        }))
    }
}

struct EsapiSession {
    context: Option<Context>,
    /// Public areas returned by `CreatePrimary`, by loaded handle.
    publics: HashMap<KeyContext, Public>,
}

impl EsapiSession {
    fn context(&mut self) -> Result<&mut Context> {
        self.context
            .as_mut()
            .ok_or_else(|| DhError::ModuleSession("TPM session already closed".into()))
    }
}

fn tss_curve(curve: Curve) -> Result<EccCurve> {
    match curve.name() {
        "P256" => Ok(EccCurve::NistP256),
        other => Err(DhError::ModuleKeyDerivation(format!(
            "curve {other} not supported by the TPM backend"
        ))),
    }
}

fn tss_auth(auth: &AuthValue) -> std::result::Result<Auth, tss_esapi::Error> {
    Auth::try_from(auth.as_bytes().to_vec())
}

fn build_public(template: &PrimaryTemplate) -> Result<Public> {
    let derivation = |e: tss_esapi::Error| DhError::ModuleKeyDerivation(e.to_string());
    let attrs = &template.attributes;

    let object_attributes = ObjectAttributesBuilder::new()
        .with_decrypt(attrs.decrypt)
        .with_sensitive_data_origin(attrs.sensitive_data_origin)
        .with_user_with_auth(attrs.user_with_auth)
        .with_fixed_tpm(attrs.fixed_tpm)
        .with_fixed_parent(attrs.fixed_parent)
        .build()
        .map_err(derivation)?;

    let ecc_parameters = PublicEccParametersBuilder::new()
        .with_ecc_scheme(EccScheme::Null)
        .with_curve(tss_curve(template.curve)?)
        .with_is_signing_key(false)
        .with_is_decryption_key(attrs.decrypt)
        .with_restricted(false)
        .with_symmetric(SymmetricDefinitionObject::Null)
        .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
        .build()
        .map_err(derivation)?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Ecc)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_ecc_parameters(ecc_parameters)
        .with_ecc_unique_identifier(TssEccPoint::default())
        .build()
        .map_err(derivation)
}

impl TpmSession for EsapiSession {
    fn create_primary(
        &mut self,
        template: &PrimaryTemplate,
        auth: &AuthValue,
    ) -> Result<KeyContext> {
        let derivation = |e: tss_esapi::Error| DhError::ModuleKeyDerivation(e.to_string());
        let public = build_public(template)?;
        let auth = tss_auth(auth).map_err(derivation)?;
        let hierarchy = match template.hierarchy {
            Hierarchy::Owner => TssHierarchy::Owner,
            Hierarchy::Endorsement => TssHierarchy::Endorsement,
        };

        // ESYS records the userAuth passed here on the new object, so no
        // tr_set_auth is needed before the caller takes ownership of it.
        let result = self
            .context()?
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(hierarchy, public, Some(auth), None, None, None)
            })
            .map_err(derivation)?;

        let key = KeyContext(ESYS_TR::from(result.key_handle));
        self.publics.insert(key, result.out_public);
        Ok(key)
    }

    fn primary_public(&mut self, key: KeyContext) -> Result<EccPoint> {
        match self.publics.get(&key) {
            Some(Public::Ecc { unique, .. }) => Ok(EccPoint {
                x: unique.x().value().to_vec(),
                y: unique.y().value().to_vec(),
            }),
            Some(_) => Err(DhError::ModuleKeyDerivation(
                "primary key is not an ECC key".into(),
            )),
            None => Err(DhError::ModuleKeyDerivation(format!(
                "handle {:#x} not created in this session",
                key.0
            ))),
        }
    }

    fn ecdh_z_gen(
        &mut self,
        key: KeyContext,
        auth: &AuthValue,
        peer: &EccPoint,
    ) -> Result<EccPoint> {
        let agreement = |e: tss_esapi::Error| DhError::ModuleAgreement(e.to_string());
        let key_handle = KeyHandle::from(key.0);
        let point = TssEccPoint::new(
            EccParameter::try_from(peer.x.clone()).map_err(agreement)?,
            EccParameter::try_from(peer.y.clone()).map_err(agreement)?,
        );

        let context = self.context()?;
        context
            .tr_set_auth(ObjectHandle::from(key_handle), tss_auth(auth).map_err(agreement)?)
            .map_err(agreement)?;
        let z = context
            .execute_with_nullauth_session(|ctx| ctx.ecdh_z_gen(key_handle, point))
            .map_err(agreement)?;

        Ok(EccPoint {
            x: z.x().value().to_vec(),
            y: z.y().value().to_vec(),
        })
    }

    fn flush_context(&mut self, key: KeyContext) -> Result<()> {
        self.publics.remove(&key);
        let handle = ObjectHandle::from(KeyHandle::from(key.0));
        self.context()?
            .flush_context(handle)
            .map_err(|e| DhError::ModuleSession(e.to_string()))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the ESAPI context finalizes it and releases the TCTI.
        self.context.take();
        Ok(())
    }
}
