use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Builder, X509Name, X509};
use crate::ids::SecurityId;
use crate::security::identity::Identity;

/// A throwaway certificate authority for tests, issuing short-lived EC certificates
pub struct TestPki {
    ca_cert: X509,
    ca_key: PKey<Private>,
}

impl TestPki {
    pub fn new() -> TestPki {
        let ca_key = new_key();

        let mut builder = X509Builder::new().expect("x509 builder");
        builder.set_version(2).expect("version");
        builder.set_serial_number(&serial_number()).expect("serial number");
        let name = subject("test-ca");
        builder.set_subject_name(&name).expect("subject");
        builder.set_issuer_name(&name).expect("issuer");
        builder.set_pubkey(&ca_key).expect("public key");
        builder.set_not_before(&Asn1Time::days_from_now(0).expect("not before")).expect("not before");
        builder.set_not_after(&Asn1Time::days_from_now(2).expect("not after")).expect("not after");
        builder.append_extension(BasicConstraints::new().critical().ca().build().expect("basic constraints")).expect("basic constraints");
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().expect("key usage")).expect("key usage");
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None)).expect("subject key id");
        builder.append_extension(ski).expect("subject key id");
        builder.sign(&ca_key, MessageDigest::sha256()).expect("sign");

        TestPki {
            ca_cert: builder.build(),
            ca_key,
        }
    }

    pub fn ca_pem(&self) -> Vec<u8> {
        self.ca_cert.to_pem().expect("CA to PEM")
    }

    /// Issues a certificate for `common_name`, returning certificate and private key as PEM
    pub fn issue(&self, common_name: &str) -> (Vec<u8>, Vec<u8>) {
        let key = new_key();

        let mut builder = X509Builder::new().expect("x509 builder");
        builder.set_version(2).expect("version");
        builder.set_serial_number(&serial_number()).expect("serial number");
        builder.set_subject_name(&subject(common_name)).expect("subject");
        builder.set_issuer_name(self.ca_cert.subject_name()).expect("issuer");
        builder.set_pubkey(&key).expect("public key");
        builder.set_not_before(&Asn1Time::days_from_now(0).expect("not before")).expect("not before");
        builder.set_not_after(&Asn1Time::days_from_now(1).expect("not after")).expect("not after");
        builder.append_extension(BasicConstraints::new().build().expect("basic constraints")).expect("basic constraints");
        builder.append_extension(KeyUsage::new().critical().digital_signature().key_agreement().build().expect("key usage")).expect("key usage");
        builder.sign(&self.ca_key, MessageDigest::sha256()).expect("sign");

        let cert = builder.build().to_pem().expect("cert to PEM");
        let key = key.private_key_to_pem_pkcs8().expect("key to PEM");
        (cert, key)
    }

    pub fn identity(&self, security_id: SecurityId, common_name: &str) -> Identity {
        let (cert, key) = self.issue(common_name);
        Identity::new(security_id, &cert, &key, &self.ca_pem()).expect("identity")
    }
}

impl Default for TestPki {
    fn default() -> Self {
        Self::new()
    }
}

fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("EC group");
    let key = EcKey::generate(&group).expect("EC key");
    PKey::from_ec_key(key).expect("private key")
}

fn serial_number() -> openssl::asn1::Asn1Integer {
    let mut serial = BigNum::new().expect("big num");
    serial.rand(64, MsbOption::MAYBE_ZERO, false).expect("random serial");
    serial.to_asn1_integer().expect("serial to ASN.1")
}

fn subject(common_name: &str) -> X509Name {
    let mut name = X509Name::builder().expect("name builder");
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).expect("common name");
    name.build()
}
