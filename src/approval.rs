use crate::models::TextUnit;

/// Flags a text unit should carry after a submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagUpdate {
    pub has_translate: bool,
    pub translate_approved: bool,
    /// Either flag differs from the unit's current value
    pub changed: bool,
}

/// Decide the unit flags after `text` is submitted for it.
///
/// Text identical to the source is always approved. Otherwise an existing
/// approval survives only when the caller asked to transfer it; editing an
/// approved unit without transfer intent un-approves it.
pub fn propagate(unit: &TextUnit, text: &str, approve_transfer: bool) -> FlagUpdate {
    let translate_approved = if text == unit.source_text {
        true
    } else if unit.translate_approved {
        approve_transfer
    } else {
        false
    };
    let has_translate = true;

    FlagUpdate {
        has_translate,
        translate_approved,
        changed: has_translate != unit.has_translate
            || translate_approved != unit.translate_approved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnitKey;
    use proptest::prelude::*;

    fn unit(source: &str, has_translate: bool, approved: bool) -> TextUnit {
        TextUnit {
            has_translate,
            translate_approved: approved,
            ..TextUnit::new(UnitKey::new("p", "1", 1), source)
        }
    }

    #[test]
    fn test_first_submit_sets_has_translate() {
        let update = propagate(&unit("Hello", false, false), "Bonjour", false);
        assert!(update.has_translate);
        assert!(!update.translate_approved);
        assert!(update.changed);
    }

    #[test]
    fn test_text_equal_to_source_is_approved() {
        let update = propagate(&unit("OK", true, false), "OK", false);
        assert!(update.translate_approved);
        assert!(update.changed);
    }

    #[test]
    fn test_edit_without_transfer_unapproves() {
        let update = propagate(&unit("Hello", true, true), "Salut", false);
        assert!(!update.translate_approved);
        assert!(update.changed);
    }

    #[test]
    fn test_edit_with_transfer_keeps_approval() {
        let update = propagate(&unit("Hello", true, true), "Salut", true);
        assert!(update.translate_approved);
        assert!(!update.changed);
    }

    #[test]
    fn test_transfer_never_grants_approval() {
        let update = propagate(&unit("Hello", true, false), "Salut", true);
        assert!(!update.translate_approved);
        assert!(!update.changed);
    }

    proptest! {
        #[test]
        fn prop_source_text_always_approved(
            source in ".{0,20}",
            has in any::<bool>(),
            approved in any::<bool>(),
            transfer in any::<bool>(),
        ) {
            let update = propagate(&unit(&source, has, approved), &source, transfer);
            prop_assert!(update.translate_approved);
            prop_assert!(update.has_translate);
        }

        #[test]
        fn prop_changed_matches_flag_difference(
            source in "[a-c]{1,3}",
            text in "[a-c]{1,3}",
            has in any::<bool>(),
            approved in any::<bool>(),
            transfer in any::<bool>(),
        ) {
            let u = unit(&source, has, approved);
            let update = propagate(&u, &text, transfer);
            let differs = update.has_translate != u.has_translate
                || update.translate_approved != u.translate_approved;
            prop_assert_eq!(update.changed, differs);
        }
    }
}
