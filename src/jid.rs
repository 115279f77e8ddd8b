//! JID normalization and dual-format resolution.
//!
//! A contact can be addressed either by direct phone number
//! (`<digits>@s.whatsapp.net`) or by anonymized linked id (`<lid>@lid`),
//! and a conversation may have been recorded under either form depending on
//! when it was first observed. Read paths therefore try every candidate
//! format until one yields results. Group JIDs (`@g.us`) are never converted.

use crate::transport::LidMapper;

pub const DIRECT_SUFFIX: &str = "@s.whatsapp.net";
pub const GROUP_SUFFIX: &str = "@g.us";
pub const LID_SUFFIX: &str = "@lid";

/// Normalizes a phone number into direct-addressing form. Idempotent.
pub fn to_direct_form(phone: &str) -> String {
    if phone.ends_with(DIRECT_SUFFIX) {
        return phone.to_string();
    }
    let mut digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.push_str(DIRECT_SUFFIX);
    digits
}

/// Normalizes a group identifier into group form. Idempotent.
pub fn to_group_form(group: &str) -> String {
    if group.ends_with(GROUP_SUFFIX) {
        return group.to_string();
    }
    let mut id: String = group
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    id.push_str(GROUP_SUFFIX);
    id
}

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(GROUP_SUFFIX)
}

/// Normalizes a raw recipient as given by a caller. A JID with a known
/// suffix passes through; a bare identifier containing `-` is a group id,
/// anything else a phone number.
pub fn normalize_recipient(raw: &str) -> String {
    if raw.ends_with(DIRECT_SUFFIX) || raw.ends_with(GROUP_SUFFIX) || raw.ends_with(LID_SUFFIX) {
        return raw.to_string();
    }
    if raw.contains('-') {
        to_group_form(raw)
    } else {
        to_direct_form(raw)
    }
}

fn user_part(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

/// Syntactic `@lid` <-> `@s.whatsapp.net` swap of the user part. Group and
/// unrecognized JIDs come back unchanged.
pub fn alternate_form(jid: &str) -> String {
    if jid.ends_with(LID_SUFFIX) {
        format!("{}{}", user_part(jid), DIRECT_SUFFIX)
    } else if jid.ends_with(DIRECT_SUFFIX) {
        format!("{}{}", user_part(jid), LID_SUFFIX)
    } else {
        jid.to_string()
    }
}

/// All representations a conversation may be stored under: the JID itself
/// plus its counterpart in the other addressing scheme.
///
/// When a mapper is available the counterpart is resolved through the
/// protocol client's identity mapping; a failed or missing resolution
/// degrades to the syntactic swap. Group JIDs yield a single candidate.
pub async fn candidate_formats(jid: &str, mapper: Option<&dyn LidMapper>) -> Vec<String> {
    if is_group_jid(jid) {
        return vec![jid.to_string()];
    }

    let mut formats = vec![jid.to_string()];
    let user = user_part(jid);

    let resolved = match mapper {
        Some(mapper) if jid.ends_with(DIRECT_SUFFIX) => mapper
            .lid_for_pn(user)
            .await
            .map(|lid| format!("{lid}{LID_SUFFIX}")),
        Some(mapper) if jid.ends_with(LID_SUFFIX) => mapper
            .pn_for_lid(user)
            .await
            .map(|pn| format!("{pn}{DIRECT_SUFFIX}")),
        _ => None,
    };

    let alternate = resolved.unwrap_or_else(|| alternate_form(jid));
    if alternate != jid {
        formats.push(alternate);
    }
    formats
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedMapper;

    #[async_trait]
    impl LidMapper for FixedMapper {
        async fn lid_for_pn(&self, pn: &str) -> Option<String> {
            (pn == "559980000001").then(|| "100000012345678".to_string())
        }

        async fn pn_for_lid(&self, lid: &str) -> Option<String> {
            (lid == "100000012345678").then(|| "559980000001".to_string())
        }

        async fn store_mapping(&self, _lid: &str, _pn: &str) {}
    }

    #[test]
    fn direct_form_normalization_is_idempotent() {
        assert_eq!(to_direct_form("+55 (99) 8000-0001"), "559980000001@s.whatsapp.net");
        assert_eq!(
            to_direct_form("559980000001@s.whatsapp.net"),
            "559980000001@s.whatsapp.net"
        );
    }

    #[test]
    fn group_form_keeps_hyphens() {
        assert_eq!(to_group_form("123456-789"), "123456-789@g.us");
        assert_eq!(to_group_form("123456-789@g.us"), "123456-789@g.us");
    }

    #[test]
    fn recipient_normalization_distinguishes_groups() {
        assert_eq!(normalize_recipient("559980000001"), "559980000001@s.whatsapp.net");
        assert_eq!(normalize_recipient("123456-789"), "123456-789@g.us");
        assert_eq!(normalize_recipient("1234@lid"), "1234@lid");
        assert_eq!(
            normalize_recipient("559980000001@s.whatsapp.net"),
            "559980000001@s.whatsapp.net"
        );
    }

    #[test]
    fn alternate_form_swaps_suffixes() {
        assert_eq!(alternate_form("1234@lid"), "1234@s.whatsapp.net");
        assert_eq!(alternate_form("1234@s.whatsapp.net"), "1234@lid");
        assert_eq!(alternate_form("1234@g.us"), "1234@g.us");
    }

    #[tokio::test]
    async fn candidates_resolve_through_mapper() {
        let formats =
            candidate_formats("559980000001@s.whatsapp.net", Some(&FixedMapper)).await;
        assert_eq!(
            formats,
            vec![
                "559980000001@s.whatsapp.net".to_string(),
                "100000012345678@lid".to_string(),
            ]
        );

        let formats = candidate_formats("100000012345678@lid", Some(&FixedMapper)).await;
        assert_eq!(
            formats,
            vec![
                "100000012345678@lid".to_string(),
                "559980000001@s.whatsapp.net".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn unresolvable_jid_degrades_to_syntactic_swap() {
        let formats = candidate_formats("111@s.whatsapp.net", Some(&FixedMapper)).await;
        assert_eq!(
            formats,
            vec!["111@s.whatsapp.net".to_string(), "111@lid".to_string()]
        );
    }

    #[tokio::test]
    async fn group_jids_are_never_converted() {
        let formats = candidate_formats("123-456@g.us", Some(&FixedMapper)).await;
        assert_eq!(formats, vec!["123-456@g.us".to_string()]);
    }
}
