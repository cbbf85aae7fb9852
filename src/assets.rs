//! Static content served next to the correlation endpoints.

/// `Cache-Control` for the landing page.
pub const LANDING_CACHE_CONTROL: &str = "public, max-age=900";
/// `Cache-Control` for the probe scripts.
pub const SCRIPT_CACHE_CONTROL: &str = "public, max-age=86400";
/// `Cache-Control` for robots.txt.
pub const ROBOTS_CACHE_CONTROL: &str = "public, max-age=604800";

/// Body of `/robots.txt`.
pub const ROBOTS_TXT: &str = "# Hi Robot!\n";

/// Delay before the script fires its probe, in milliseconds.
const PROBE_DELAY_MS: u32 = 3200;

/// Landing page. Loads the probe script so visiting it runs one probe.
pub const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>DNS Mapper</title>
</head>
<body>
<h1>DNS Mapper</h1>
<p>
This site maps which DNS resolvers are used by which clients. Loading this
page makes your browser look up a random name under this domain and then
fetch it, which tells us the address of the resolver that did the lookup.
</p>
<p>
No cookies are set and nothing beyond the resolver address, your address and
the EDNS client subnet (if your resolver sends one) is recorded.
</p>
<p>
To help, include <code>&lt;script src="//www.DOMAIN/mapper.js" async&gt;&lt;/script&gt;</code>
on your site.
</p>
<script src="/mapper.js" async></script>
</body>
</html>
"#;

/// How the probe script picks the scheme of the image it loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeScheme {
    /// Always plain HTTP.
    Http,
    /// Whatever scheme the embedding page uses.
    PageScheme,
}

/// The probe script for `base_domain`.
///
/// After a short delay it requests `/none` from a random host under the
/// base domain, which runs both halves of a probe without any further
/// interaction.
pub fn mapper_script(base_domain: &str, scheme: ProbeScheme) -> String {
    let prefix = match scheme {
        ProbeScheme::Http => r#""http://""#,
        ProbeScheme::PageScheme => r#"global.location.protocol+"//""#,
    };
    format!(
        r#"(function(global){{"use strict";
var id=function(){{var chars="0123456789abcdefghijklmnopqrstuvwxyz".split(""),uuid=[],i;
for(i=0;i<17;i++){{uuid[i]=chars[0|Math.random()*chars.length]}}
return uuid.join("")}};
setTimeout(function(){{(new Image).src={prefix}+id()+".{base_domain}/none"}},{PROBE_DELAY_MS})}})(this);
"#
    )
}

/// Body of `/version`.
pub fn version_page() -> String {
    format!(
        "<html><head><title>DNS Mapper {}</title></head><body>Hello</body></html>\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Landing page with the base domain filled in.
pub fn landing_page(base_domain: &str) -> String {
    LANDING_PAGE.replace("DOMAIN", base_domain)
}
