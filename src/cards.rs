use base64::Engine as _;
use serde_json::Value;

use crate::core::errors::ChatError;
use crate::store::types::CharacterDraft;

/// Parse an interoperable character card into a character draft.
///
/// Accepts raw card JSON or its base64 form (as extracted from a PNG by the
/// external chunk decoder). Understands the `chara_card_v2` envelope and the
/// flat v1 layout.
pub fn parse_character_card(input: &str) -> Result<CharacterDraft, ChatError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ChatError::validation("character card is empty"));
    }

    let json_text = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(trimmed.as_bytes())
            .map_err(|_| ChatError::validation("character card is neither JSON nor base64"))?;
        String::from_utf8(bytes)
            .map_err(|_| ChatError::validation("decoded character card is not UTF-8"))?
    };

    let value: Value = serde_json::from_str(&json_text)
        .map_err(|e| ChatError::validation(format!("invalid character card JSON: {e}")))?;

    // v2 cards nest the payload under "data"; v1 cards are flat.
    let data = if value.get("spec").and_then(|v| v.as_str()) == Some("chara_card_v2") {
        value
            .get("data")
            .cloned()
            .ok_or_else(|| ChatError::validation("chara_card_v2 card is missing its data block"))?
    } else {
        value
    };

    let name = read_string(&data, "name");
    if name.trim().is_empty() {
        return Err(ChatError::validation("character card has no name"));
    }

    Ok(CharacterDraft {
        name,
        description: read_string(&data, "description"),
        personality: read_string(&data, "personality"),
        scenario: read_string(&data, "scenario"),
        backstory: read_string(&data, "creator_notes"),
        system_prompt: read_optional(&data, "system_prompt"),
        first_message: read_optional(&data, "first_mes"),
        alternate_greetings: read_string_list(&data, "alternate_greetings"),
        example_dialogues: read_optional(&data, "mes_example"),
        physical_traits: None,
        speech_patterns: None,
        likes: Vec::new(),
        dislikes: Vec::new(),
        tags: read_string_list(&data, "tags"),
        avatar_ref: None,
        rating: None,
        pov_type: None,
        is_bundled: false,
    })
}

fn read_string(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn read_optional(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn read_string_list(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_v2_card() {
        let card = json!({
            "spec": "chara_card_v2",
            "spec_version": "2.0",
            "data": {
                "name": "Aria",
                "description": "A wandering bard.",
                "personality": "curious",
                "scenario": "a tavern",
                "first_mes": "Well met, {{user}}!",
                "mes_example": "{{user}}: hi\n{{char}}: ho",
                "alternate_greetings": ["Ho there."],
                "system_prompt": "",
                "tags": ["fantasy", "bard"]
            }
        });

        let draft = parse_character_card(&card.to_string()).unwrap();
        assert_eq!(draft.name, "Aria");
        assert_eq!(draft.first_message.as_deref(), Some("Well met, {{user}}!"));
        assert_eq!(draft.alternate_greetings, vec!["Ho there.".to_string()]);
        assert_eq!(draft.tags.len(), 2);
        // Empty system_prompt collapses to None.
        assert!(draft.system_prompt.is_none());
    }

    #[test]
    fn parses_a_flat_v1_card() {
        let card = json!({
            "name": "Bram",
            "description": "A gruff blacksmith.",
            "first_mes": "What do you want?"
        });
        let draft = parse_character_card(&card.to_string()).unwrap();
        assert_eq!(draft.name, "Bram");
        assert_eq!(draft.first_message.as_deref(), Some("What do you want?"));
    }

    #[test]
    fn parses_base64_input() {
        let card = json!({ "name": "Caz" }).to_string();
        let encoded = base64::engine::general_purpose::STANDARD.encode(card.as_bytes());
        let draft = parse_character_card(&encoded).unwrap();
        assert_eq!(draft.name, "Caz");
    }

    #[test]
    fn rejects_nameless_and_malformed_cards() {
        assert!(parse_character_card("{}").is_err());
        assert!(parse_character_card("not a card").is_err());
        assert!(parse_character_card("").is_err());
    }
}
