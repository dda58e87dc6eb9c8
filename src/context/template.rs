/// Substitute the recognized placeholders in character text.
///
/// The placeholder set is closed: `{{user}}` becomes the persona name (or
/// "You" without a persona), `{{char}}` becomes the responding character's
/// name. Nothing else is interpreted.
pub fn substitute(text: &str, user_name: &str, char_name: &str) -> String {
    text.replace("{{user}}", user_name)
        .replace("{{char}}", char_name)
}

pub const DEFAULT_USER_NAME: &str = "You";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_both_placeholders() {
        let out = substitute("{{char}} waves at {{user}}. {{user}} waves back.", "Sam", "Aria");
        assert_eq!(out, "Aria waves at Sam. Sam waves back.");
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let out = substitute("{{world}} stays as-is", "Sam", "Aria");
        assert_eq!(out, "{{world}} stays as-is");
    }
}
