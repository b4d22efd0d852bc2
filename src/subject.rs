//! Subject distinguished names: template defaults plus the CN/OU resolution policy for users and
//! servers.

use openssl::nid::Nid;
use openssl::x509::{X509Name, X509NameRef};

use crate::configs::SubjectDefaults;
use crate::error::{CaError, CaResult};
use crate::model::{ServerProfile, UserProfile};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubjectName {
    pub common_name: String,
    pub organizational_unit: Option<String>,
    pub organization: Option<String>,
    pub locality: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub email: Option<String>,
}

/// Pick CN and OU for an owning entity.
///
/// Explicit values win. A missing CN falls back to `display_name`; a missing OU stays absent.
/// Blank strings count as missing.
pub fn resolve_cn_ou(
    display_name: &str,
    common_name: Option<&str>,
    organizational_unit: Option<&str>,
) -> (String, Option<String>) {
    let cn = non_blank(common_name).unwrap_or_else(|| display_name.trim().to_string());
    (cn, non_blank(organizational_unit))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl SubjectName {
    /// Template fields (O, L, ST, C, email) with the given CN and OU.
    pub fn from_template(
        template: &SubjectDefaults,
        common_name: String,
        organizational_unit: Option<String>,
    ) -> Self {
        Self {
            common_name,
            organizational_unit,
            organization: non_blank(Some(&template.organization)),
            locality: non_blank(Some(&template.locality)),
            state: non_blank(Some(&template.state)),
            country: non_blank(Some(&template.country)),
            email: non_blank(Some(&template.email)),
        }
    }

    pub fn root(template: &SubjectDefaults) -> Self {
        let cn = non_blank(Some(&template.root_common_name))
            .unwrap_or_else(|| template.organization.clone());
        Self::from_template(template, cn, non_blank(Some(&template.organizational_unit)))
    }

    pub fn intermediate(template: &SubjectDefaults) -> Self {
        let cn = non_blank(Some(&template.intermediate_common_name))
            .unwrap_or_else(|| format!("{} Intermediate", template.organization));
        Self::from_template(template, cn, non_blank(Some(&template.organizational_unit)))
    }

    pub fn for_server(template: &SubjectDefaults, server: &ServerProfile) -> Self {
        let (cn, ou) = resolve_cn_ou(
            &server.name,
            server.common_name.as_deref(),
            server.organizational_unit.as_deref(),
        );
        Self::from_template(template, cn, ou)
    }

    pub fn for_user(template: &SubjectDefaults, user: &UserProfile) -> Self {
        let (cn, ou) = resolve_cn_ou(
            &user.username,
            user.common_name.as_deref(),
            user.organizational_unit.as_deref(),
        );
        Self::from_template(template, cn, ou)
    }

    /// Read the fields back out of an issued certificate, for renewal.
    pub fn from_x509_name(name: &X509NameRef) -> Self {
        Self {
            common_name: entry(name, Nid::COMMONNAME).unwrap_or_default(),
            organizational_unit: entry(name, Nid::ORGANIZATIONALUNITNAME),
            organization: entry(name, Nid::ORGANIZATIONNAME),
            locality: entry(name, Nid::LOCALITYNAME),
            state: entry(name, Nid::STATEORPROVINCENAME),
            country: entry(name, Nid::COUNTRYNAME),
            email: entry(name, Nid::PKCS9_EMAILADDRESS),
        }
    }

    pub fn to_x509_name(&self) -> CaResult<X509Name> {
        if self.common_name.trim().is_empty() {
            return Err(CaError::InvalidRequest(
                "subject common name is empty".to_string(),
            ));
        }
        let mut builder =
            X509Name::builder().map_err(|e| CaError::signing("Failed to create name builder", e))?;
        let fields = [
            (Nid::COUNTRYNAME, self.country.as_deref()),
            (Nid::STATEORPROVINCENAME, self.state.as_deref()),
            (Nid::LOCALITYNAME, self.locality.as_deref()),
            (Nid::ORGANIZATIONNAME, self.organization.as_deref()),
            (Nid::ORGANIZATIONALUNITNAME, self.organizational_unit.as_deref()),
            (Nid::COMMONNAME, Some(self.common_name.as_str())),
            (Nid::PKCS9_EMAILADDRESS, self.email.as_deref()),
        ];
        for (nid, value) in fields {
            if let Some(value) = value {
                builder.append_entry_by_nid(nid, value).map_err(|e| {
                    CaError::signing(&format!("Failed to set {}", nid.short_name().unwrap_or("?")), e)
                })?;
            }
        }
        Ok(builder.build())
    }
}

fn entry(name: &X509NameRef, nid: Nid) -> Option<String> {
    name.entries_by_nid(nid)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
}

/// Render a name as `C=.., O=.., CN=..` in certificate order.
pub fn dn_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|e| {
            let key = e.object().nid().short_name().unwrap_or("?");
            let value = e
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// First CN of a name, if any.
pub fn common_name(name: &X509NameRef) -> Option<String> {
    entry(name, Nid::COMMONNAME)
}
