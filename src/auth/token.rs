use super::traits::Claims;
use crate::store::{Application, Cert, User};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use std::str::FromStr;
use uuid::Uuid;

/// Signs and verifies JWTs with the key material of one certificate.
pub struct JwtSigner {
    algorithm: Algorithm,
    kid: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtSigner {
    pub fn from_cert(cert: &Cert) -> Result<Self> {
        let algorithm = Algorithm::from_str(&cert.crypto_algorithm).map_err(|e| {
            anyhow!(
                "cert {}/{} declares unknown algorithm '{}': {}",
                cert.owner,
                cert.name,
                cert.crypto_algorithm,
                e
            )
        })?;

        let private = cert.private_key.as_bytes();
        let public = cert.certificate.as_bytes();
        let (encoding_key, decoding_key) = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                if private.is_empty() {
                    return Err(anyhow!("cert {}/{} has an empty secret", cert.owner, cert.name));
                }
                (EncodingKey::from_secret(private), DecodingKey::from_secret(private))
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                (EncodingKey::from_ec_pem(private)?, DecodingKey::from_ec_pem(public)?)
            }
            Algorithm::EdDSA => {
                (EncodingKey::from_ed_pem(private)?, DecodingKey::from_ed_pem(public)?)
            }
            _ => (EncodingKey::from_rsa_pem(private)?, DecodingKey::from_rsa_pem(public)?),
        };

        Ok(Self {
            algorithm,
            kid: cert.name.clone(),
            encoding_key,
            decoding_key,
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key).map_err(|e| anyhow!("Failed to encode JWT: {}", e))
    }

    /// Checks signature, exp, nbf and that `aud` is the expected client id
    pub fn verify(&self, token: &str, audience: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_audience(&[audience]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = 0;
        validation.required_spec_claims = ["exp", "sub", "aud", "iat"]
            .into_iter()
            .map(String::from)
            .collect();

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow!("Invalid JWT: {}", e))?;
        Ok(token_data.claims)
    }
}

/// Everything needed to mint one JWT for a user of an application
pub struct ClaimsInput<'a> {
    pub issuer: &'a str,
    pub user: &'a User,
    pub application: &'a Application,
    pub scope: &'a str,
    pub token_use: &'a str,
    pub issued_at: DateTime<Utc>,
    pub lifetime: Duration,
    /// Seconds `nbf` is backdated to tolerate client clock drift
    pub skew: i64,
    pub nonce: &'a str,
    pub tag: &'a str,
    pub avatar: &'a str,
}

pub fn build_claims(input: ClaimsInput<'_>) -> Claims {
    let iat = input.issued_at.timestamp();
    Claims {
        iss: input.issuer.to_string(),
        sub: input.user.id.clone(),
        aud: input.application.client_id.clone(),
        exp: (input.issued_at + input.lifetime).timestamp(),
        iat,
        nbf: iat - input.skew.max(0),
        jti: Uuid::new_v4().to_string(),
        scope: input.scope.to_string(),
        token_type: input.token_use.to_string(),
        owner: input.user.owner.clone(),
        name: input.user.name.clone(),
        nonce: input.nonce.to_string(),
        // extension fields pass through untouched; fall back to the user's own values
        tag: if input.tag.is_empty() {
            input.user.tag.clone()
        } else {
            input.tag.to_string()
        },
        avatar: if input.avatar.is_empty() {
            input.user.avatar.clone()
        } else {
            input.avatar.to_string()
        },
    }
}

/// `iss` for tokens minted on behalf of a request that arrived at `host`
pub fn issuer_origin(host: &str, public_url: Option<&str>) -> String {
    if let Some(url) = public_url {
        return url.trim_end_matches('/').to_string();
    }
    let hostname = host.split(':').next().unwrap_or(host);
    if hostname == "localhost" || hostname == "127.0.0.1" || host.starts_with("[::1]") {
        format!("http://{}", host)
    } else {
        format!("https://{}", host)
    }
}
