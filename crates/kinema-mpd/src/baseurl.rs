//! BaseURL candidate collection across the MPD hierarchy.

use url::Url;

use crate::model::{MpdDocument, RepresentationAddress};
use crate::steering::CandidateUrl;

/// Collect the candidate absolute base URLs for one representation, walking
/// Representation → AdaptationSet → Period → MPD and finally the document
/// URL itself. Relative entries resolve against the document URL. Each
/// candidate carries a CDN label: the `@serviceLocation` when present (DVB),
/// otherwise the URL host.
pub fn collect_base_url_candidates(
    doc: &MpdDocument,
    addr: RepresentationAddress,
) -> Vec<CandidateUrl> {
    let mut out = Vec::new();
    let rep = match doc.representation(addr) {
        Some(r) => r,
        None => return out,
    };
    let aset = match doc.adaptation_set(addr.adaptation_set_address()) {
        Some(a) => a,
        None => return out,
    };
    let period = match doc.period(addr.period_address()) {
        Some(p) => p,
        None => return out,
    };

    let levels = [
        &rep.base_urls,
        &aset.base_urls,
        &period.base_urls,
        &doc.base_urls,
    ];
    for level in levels {
        for base in level.iter() {
            if let Ok(resolved) = doc.document_url.join(&base.url) {
                out.push(CandidateUrl {
                    cdn: cdn_label(&resolved, base.service_location.as_deref()),
                    url: resolved,
                    priority: base.priority,
                    weight: base.weight,
                });
            }
        }
        // Nearest hierarchy level with BaseURL elements wins; deeper levels
        // are alternatives of each other, not of their parents.
        if !out.is_empty() {
            return out;
        }
    }

    // No BaseURL anywhere: the document URL itself is the base.
    out.push(CandidateUrl {
        cdn: cdn_label(&doc.document_url, None),
        url: doc.document_url.clone(),
        priority: 1,
        weight: 1,
    });
    out
}

fn cdn_label(url: &Url, service_location: Option<&str>) -> String {
    if let Some(loc) = service_location {
        if !loc.is_empty() {
            return loc.to_string();
        }
    }
    url.host_str().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_mpd;

    fn doc(xml: &str) -> MpdDocument {
        parse_mpd(
            xml,
            Url::parse("https://origin.example.com/a/manifest.mpd").unwrap(),
            1,
        )
        .unwrap()
    }

    fn rep_addr(doc: &MpdDocument) -> RepresentationAddress {
        RepresentationAddress {
            generation: doc.generation,
            period: 0,
            adaptation_set: 0,
            representation: 0,
        }
    }

    #[test]
    fn nearest_level_wins_and_relatives_resolve() {
        let d = doc(r#"<MPD type="static" mediaPresentationDuration="PT10S">
          <BaseURL>http://mpd-level.example.com/x/</BaseURL>
          <Period>
            <AdaptationSet contentType="video" mimeType="video/mp4">
              <Representation id="v" bandwidth="1">
                <BaseURL serviceLocation="cdn-a" priority="2">media/</BaseURL>
                <BaseURL serviceLocation="cdn-b" priority="1">http://b.example.com/media/</BaseURL>
              </Representation>
            </AdaptationSet>
          </Period>
        </MPD>"#);
        let candidates = collect_base_url_candidates(&d, rep_addr(&d));
        assert_eq!(candidates.len(), 2);
        assert_eq!(
            candidates[0].url.as_str(),
            "https://origin.example.com/a/media/"
        );
        assert_eq!(candidates[0].cdn, "cdn-a");
        assert_eq!(candidates[0].priority, 2);
        assert_eq!(candidates[1].url.as_str(), "http://b.example.com/media/");
    }

    #[test]
    fn falls_back_to_document_url() {
        let d = doc(r#"<MPD type="static" mediaPresentationDuration="PT10S">
          <Period>
            <AdaptationSet contentType="video" mimeType="video/mp4">
              <Representation id="v" bandwidth="1"/>
            </AdaptationSet>
          </Period>
        </MPD>"#);
        let candidates = collect_base_url_candidates(&d, rep_addr(&d));
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].url.as_str(),
            "https://origin.example.com/a/manifest.mpd"
        );
        assert_eq!(candidates[0].cdn, "origin.example.com");
    }
}
