//! Bootstrap payload rendering.
//!
//! The template is operator-supplied text with two placeholders:
//!
//! - `{{ AZ_SUBNET_DEF_ROUTE }}`: gateway address of the replacement's subnet
//! - `{{ ROUTE_DESTINATION }}`: the routed CIDR, e.g. `10.0.0.10/32`
//!
//! Output is not HTML-escaped; the payload is usually a shell script.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use handlebars::{Handlebars, Template, TemplateError};
use ipnet::Ipv4Net;

const GATEWAY_VAR: &str = "AZ_SUBNET_DEF_ROUTE";
const DESTINATION_VAR: &str = "ROUTE_DESTINATION";

/// Render the bootstrap template for a replacement.
///
/// A template without placeholders renders to itself.
pub fn render_bootstrap(
    template: &str,
    gateway: Ipv4Addr,
    destination_cidr: Ipv4Net,
) -> Result<String, handlebars::RenderError> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);

    let mut vars = BTreeMap::new();
    vars.insert(GATEWAY_VAR, gateway.to_string());
    vars.insert(DESTINATION_VAR, destination_cidr.to_string());

    hb.render_template(template, &vars)
}

/// Check that the template compiles, so a bad file is caught at startup
/// rather than mid-failover.
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    Template::compile(template).map(|_| ())
}
