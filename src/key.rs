//! View and action key construction.
//!
//! Keys are plain strings: a base code, optionally followed by the reserved
//! separator and the request parameter. A view code `FLIGHT_LIST` with the
//! parameter `42` becomes the view key `FLIGHT_LIST::42`.

/// Separator between a base code and its parameter.
pub const SEPARATOR: &str = "::";

/// Prefix of action keys synthesized for views with no template.
pub const ACTION_PREFIX: &str = "Q_";

/// Append a parameter to a base code. With no parameter this is the identity.
pub fn wrap(code: &str, param: Option<&str>) -> String {
    match param {
        Some(param) => {
            let mut key = String::with_capacity(code.len() + SEPARATOR.len() + param.len());
            key.push_str(code);
            key.push_str(SEPARATOR);
            key.push_str(param);
            key
        }
        None => code.to_owned(),
    }
}

/// The private action key for a view with no template.
pub fn synthesized_action(view_key: &str) -> String {
    let mut key = String::with_capacity(ACTION_PREFIX.len() + view_key.len());
    key.push_str(ACTION_PREFIX);
    key.push_str(view_key);
    key
}
