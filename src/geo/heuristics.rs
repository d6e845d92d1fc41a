use crate::models::Country;

/// Ordered hostname hints, consulted only after DNS and lookup services
/// have failed. A pattern starting with `.` matches as a suffix, anything
/// else as a substring. First match wins.
pub const HOST_HINTS: &[(&str, &str)] = &[
    (".sg", "SG"),
    ("singapore", "SG"),
    (".jp", "JP"),
    ("tokyo", "JP"),
    ("osaka", "JP"),
    ("japan", "JP"),
    (".hk", "HK"),
    ("hongkong", "HK"),
    ("hong-kong", "HK"),
    (".tw", "TW"),
    ("taiwan", "TW"),
    ("taipei", "TW"),
    (".kr", "KR"),
    ("korea", "KR"),
    ("seoul", "KR"),
    (".uk", "GB"),
    ("london", "GB"),
    (".de", "DE"),
    ("frankfurt", "DE"),
    (".nl", "NL"),
    ("amsterdam", "NL"),
    (".fr", "FR"),
    ("paris", "FR"),
    (".ru", "RU"),
    ("moscow", "RU"),
    (".ca", "CA"),
    ("toronto", "CA"),
    (".au", "AU"),
    ("sydney", "AU"),
    (".in", "IN"),
    ("mumbai", "IN"),
    (".us", "US"),
    ("losangeles", "US"),
    ("los-angeles", "US"),
    ("newyork", "US"),
    ("seattle", "US"),
];

pub fn heuristic_country(host: &str) -> Option<Country> {
    let host = host.trim().trim_end_matches('.').to_lowercase();
    HOST_HINTS
        .iter()
        .find(|(pattern, _)| {
            if pattern.starts_with('.') {
                host.ends_with(pattern)
            } else {
                host.contains(pattern)
            }
        })
        .and_then(|(_, code)| Country::parse(code))
}
