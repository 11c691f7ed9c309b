#![forbid(unsafe_code)]

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted length of a friend code, in bytes.
pub const MAX_FRIEND_CODE_LEN: usize = 64;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long: len={len} max={max}")]
	TooLong { len: usize, max: usize },
	#[error("invalid character in value: {0:?}")]
	InvalidChar(char),
}

/// Opaque, stable identity string naming an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FriendCode(String);

impl FriendCode {
	/// Create a validated friend code: non-empty, length-bounded, printable ASCII without whitespace.
	pub fn new(code: impl Into<String>) -> Result<Self, ParseIdError> {
		let code = code.into();
		let trimmed = code.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() > MAX_FRIEND_CODE_LEN {
			return Err(ParseIdError::TooLong {
				len: trimmed.len(),
				max: MAX_FRIEND_CODE_LEN,
			});
		}
		if let Some(c) = trimmed.chars().find(|c| !c.is_ascii_graphic()) {
			return Err(ParseIdError::InvalidChar(c));
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for FriendCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for FriendCode {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		FriendCode::new(s)
	}
}

/// A single named permission bit within one capability class.
pub trait Capability: Copy + Eq + 'static {
	/// Bit position within the class, `0..64`.
	fn index(self) -> u32;

	/// All capabilities of the class, for iteration/decoding.
	fn all() -> &'static [Self];
}

/// Fixed-width set of capabilities of one class, backed by a `u64` bitset.
pub struct CapabilitySet<C: Capability> {
	bits: u64,
	_class: PhantomData<C>,
}

impl<C: Capability> CapabilitySet<C> {
	pub const fn empty() -> Self {
		Self {
			bits: 0,
			_class: PhantomData,
		}
	}

	/// Rebuild a set from raw bits; bits outside the class are discarded.
	pub fn from_bits(bits: u64) -> Self {
		let mut mask = 0u64;
		for c in C::all() {
			mask |= 1u64 << c.index();
		}
		Self {
			bits: bits & mask,
			_class: PhantomData,
		}
	}

	pub const fn bits(&self) -> u64 {
		self.bits
	}

	pub fn is_empty(&self) -> bool {
		self.bits == 0
	}

	pub fn contains(&self, cap: C) -> bool {
		self.bits & (1u64 << cap.index()) != 0
	}

	/// True if every bit of `other` is present in `self`.
	pub fn contains_all(&self, other: &Self) -> bool {
		self.bits & other.bits == other.bits
	}

	pub fn insert(&mut self, cap: C) {
		self.bits |= 1u64 << cap.index();
	}

	pub fn remove(&mut self, cap: C) {
		self.bits &= !(1u64 << cap.index());
	}

	pub fn union(&self, other: &Self) -> Self {
		Self {
			bits: self.bits | other.bits,
			_class: PhantomData,
		}
	}

	pub fn intersection(&self, other: &Self) -> Self {
		Self {
			bits: self.bits & other.bits,
			_class: PhantomData,
		}
	}

	pub fn difference(&self, other: &Self) -> Self {
		Self {
			bits: self.bits & !other.bits,
			_class: PhantomData,
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = C> + '_ {
		C::all().iter().copied().filter(|c| self.contains(*c))
	}
}

impl<C: Capability> Clone for CapabilitySet<C> {
	fn clone(&self) -> Self {
		*self
	}
}

impl<C: Capability> Copy for CapabilitySet<C> {}

impl<C: Capability> Default for CapabilitySet<C> {
	fn default() -> Self {
		Self::empty()
	}
}

impl<C: Capability> PartialEq for CapabilitySet<C> {
	fn eq(&self, other: &Self) -> bool {
		self.bits == other.bits
	}
}

impl<C: Capability> Eq for CapabilitySet<C> {}

impl<C: Capability + fmt::Debug> fmt::Debug for CapabilitySet<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.iter()).finish()
	}
}

impl<C: Capability> FromIterator<C> for CapabilitySet<C> {
	fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
		let mut set = Self::empty();
		for cap in iter {
			set.insert(cap);
		}
		set
	}
}

impl<C: Capability> Serialize for CapabilitySet<C> {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(self.bits)
	}
}

impl<'de, C: Capability> Deserialize<'de> for CapabilitySet<C> {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let bits = u64::deserialize(deserializer)?;
		Ok(Self::from_bits(bits))
	}
}

macro_rules! capability_enum {
	($(#[$meta:meta])* $name:ident { $($variant:ident = $idx:expr => $label:expr),+ $(,)? }) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum $name {
			$($variant,)+
		}

		impl $name {
			/// Stable string identifier.
			pub const fn as_str(self) -> &'static str {
				match self {
					$($name::$variant => $label,)+
				}
			}
		}

		impl Capability for $name {
			fn index(self) -> u32 {
				match self {
					$($name::$variant => $idx,)+
				}
			}

			fn all() -> &'static [Self] {
				&[$($name::$variant,)+]
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(self.as_str())
			}
		}
	};
}

capability_enum! {
	/// Capabilities gating ordinary actions.
	PrimaryCapability {
		Emote = 0 => "emote",
		GlamourerCustomization = 1 => "glamourer_customization",
		GlamourerEquipment = 2 => "glamourer_equipment",
		Mods = 3 => "mods",
		BodySwap = 4 => "body_swap",
		Twinning = 5 => "twinning",
		CustomizePlus = 6 => "customize_plus",
		Moodles = 7 => "moodles",
		Honorific = 8 => "honorific",
		Hypnosis = 9 => "hypnosis",
	}
}

capability_enum! {
	/// Chat channels a friend may be made to speak in.
	SpeakChannel {
		Say = 0 => "say",
		Yell = 1 => "yell",
		Shout = 2 => "shout",
		Tell = 3 => "tell",
		Party = 4 => "party",
		Alliance = 5 => "alliance",
		FreeCompany = 6 => "free_company",
		NoviceNetwork = 7 => "novice_network",
		PvPTeam = 8 => "pvp_team",
		Echo = 9 => "echo",
		Linkshell1 = 10 => "linkshell1",
		Linkshell2 = 11 => "linkshell2",
		Linkshell3 = 12 => "linkshell3",
		Linkshell4 = 13 => "linkshell4",
		Linkshell5 = 14 => "linkshell5",
		Linkshell6 = 15 => "linkshell6",
		Linkshell7 = 16 => "linkshell7",
		Linkshell8 = 17 => "linkshell8",
		CrossworldLinkshell1 = 18 => "crossworld_linkshell1",
		CrossworldLinkshell2 = 19 => "crossworld_linkshell2",
		CrossworldLinkshell3 = 20 => "crossworld_linkshell3",
		CrossworldLinkshell4 = 21 => "crossworld_linkshell4",
		CrossworldLinkshell5 = 22 => "crossworld_linkshell5",
		CrossworldLinkshell6 = 23 => "crossworld_linkshell6",
		CrossworldLinkshell7 = 24 => "crossworld_linkshell7",
		CrossworldLinkshell8 = 25 => "crossworld_linkshell8",
	}
}

capability_enum! {
	/// Capabilities gating especially invasive or persistent actions.
	/// Never implied by a primary or speak bit; always checked in addition.
	ElevatedCapability {
		PermanentTransformation = 0 => "permanent_transformation",
		Possession = 1 => "possession",
	}
}

impl SpeakChannel {
	/// Decode a channel from its wire bit index.
	pub fn from_index(index: u32) -> Option<Self> {
		Self::all().iter().copied().find(|c| c.index() == index)
	}
}

/// The effective grant one identity extends to another.
///
/// Grants are directional: `UserPermissions` attached to the edge `owner -> target`
/// describe what `target` may do to `owner`, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserPermissions {
	pub primary: CapabilitySet<PrimaryCapability>,
	pub speak: CapabilitySet<SpeakChannel>,
	pub elevated: CapabilitySet<ElevatedCapability>,
}

impl UserPermissions {
	pub const fn none() -> Self {
		Self {
			primary: CapabilitySet::empty(),
			speak: CapabilitySet::empty(),
			elevated: CapabilitySet::empty(),
		}
	}

	pub fn from_bits(primary: u64, speak: u64, elevated: u64) -> Self {
		Self {
			primary: CapabilitySet::from_bits(primary),
			speak: CapabilitySet::from_bits(speak),
			elevated: CapabilitySet::from_bits(elevated),
		}
	}

	/// True if this grant covers every bit `required` asks for, across all three classes.
	pub fn covers(&self, required: &UserPermissions) -> bool {
		self.primary.contains_all(&required.primary)
			&& self.speak.contains_all(&required.speak)
			&& self.elevated.contains_all(&required.elevated)
	}

	pub fn with_primary(mut self, cap: PrimaryCapability) -> Self {
		self.primary.insert(cap);
		self
	}

	pub fn with_speak(mut self, channel: SpeakChannel) -> Self {
		self.speak.insert(channel);
		self
	}

	pub fn with_elevated(mut self, cap: ElevatedCapability) -> Self {
		self.elevated.insert(cap);
		self
	}
}

/// The action kinds the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
	Emote,
	Speak,
	Transform,
	BodySwap,
	Twinning,
	Customize,
	Moodles,
	Honorific,
	Hypnosis,
	HypnosisStop,
}

impl ActionKind {
	/// Stable string identifier for logs, metrics and audit rows.
	pub const fn as_str(self) -> &'static str {
		match self {
			ActionKind::Emote => "emote",
			ActionKind::Speak => "speak",
			ActionKind::Transform => "transform",
			ActionKind::BodySwap => "body_swap",
			ActionKind::Twinning => "twinning",
			ActionKind::Customize => "customize",
			ActionKind::Moodles => "moodles",
			ActionKind::Honorific => "honorific",
			ActionKind::Hypnosis => "hypnosis",
			ActionKind::HypnosisStop => "hypnosis_stop",
		}
	}
}

impl fmt::Display for ActionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Options that modify what an action kind requires beyond its base capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionOptions {
	/// Speak: the requested channel.
	pub channel: Option<SpeakChannel>,
	/// Transform: apply the customization part of the appearance data.
	pub apply_customization: bool,
	/// Transform: apply the equipment part of the appearance data.
	pub apply_equipment: bool,
	/// Transform: the change persists across the target's own resets.
	pub permanent: bool,
	/// BodySwap/Twinning: also swap active mods.
	pub swap_mods: bool,
}

/// The single kind -> required-grant table.
///
/// Elevated bits are returned in addition to the relevant primary bit, never
/// instead of it.
pub fn required_permissions(kind: ActionKind, opts: &ActionOptions) -> UserPermissions {
	let mut required = UserPermissions::none();
	match kind {
		ActionKind::Emote => {
			required.primary.insert(PrimaryCapability::Emote);
		}
		ActionKind::Speak => {
			if let Some(channel) = opts.channel {
				required.speak.insert(channel);
			}
		}
		ActionKind::Transform => {
			if opts.apply_customization {
				required.primary.insert(PrimaryCapability::GlamourerCustomization);
			}
			if opts.apply_equipment {
				required.primary.insert(PrimaryCapability::GlamourerEquipment);
			}
			if opts.permanent {
				required.elevated.insert(ElevatedCapability::PermanentTransformation);
			}
		}
		ActionKind::BodySwap => {
			required.primary.insert(PrimaryCapability::BodySwap);
			if opts.swap_mods {
				required.primary.insert(PrimaryCapability::Mods);
			}
		}
		ActionKind::Twinning => {
			required.primary.insert(PrimaryCapability::Twinning);
			if opts.swap_mods {
				required.primary.insert(PrimaryCapability::Mods);
			}
		}
		ActionKind::Customize => {
			required.primary.insert(PrimaryCapability::CustomizePlus);
		}
		ActionKind::Moodles => {
			required.primary.insert(PrimaryCapability::Moodles);
		}
		ActionKind::Honorific => {
			required.primary.insert(PrimaryCapability::Honorific);
		}
		ActionKind::Hypnosis | ActionKind::HypnosisStop => {
			required.primary.insert(PrimaryCapability::Hypnosis);
		}
	}
	required
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn friend_code_validation() {
		let fc = FriendCode::new("  ABCD-1234  ").unwrap();
		assert_eq!(fc.as_str(), "ABCD-1234");
		assert_eq!("ABCD-1234".parse::<FriendCode>().unwrap(), fc);

		assert_eq!(FriendCode::new("   "), Err(ParseIdError::Empty));
		assert!(matches!(FriendCode::new("a".repeat(65)), Err(ParseIdError::TooLong { .. })));
		assert!(matches!(FriendCode::new("ab cd"), Err(ParseIdError::InvalidChar(' '))));
	}

	#[test]
	fn capability_set_ops() {
		let mut a: CapabilitySet<PrimaryCapability> = CapabilitySet::empty();
		a.insert(PrimaryCapability::Emote);
		a.insert(PrimaryCapability::Moodles);

		let b: CapabilitySet<PrimaryCapability> = [PrimaryCapability::Moodles].into_iter().collect();

		assert!(a.contains(PrimaryCapability::Emote));
		assert!(a.contains_all(&b));
		assert!(!b.contains_all(&a));
		assert_eq!(a.intersection(&b), b);
		assert_eq!(a.difference(&b).iter().collect::<Vec<_>>(), vec![PrimaryCapability::Emote]);
		assert_eq!(a.union(&b), a);
	}

	#[test]
	fn capability_sets_work_through_a_generic_class() {
		// Decode and iterate via the trait alone, not a concrete class.
		fn roundtrip<C: Capability>(bits: u64) -> Vec<C> {
			CapabilitySet::<C>::from_bits(bits).iter().collect()
		}

		let caps: Vec<PrimaryCapability> = roundtrip(0b11);
		assert_eq!(caps, vec![PrimaryCapability::Emote, PrimaryCapability::GlamourerCustomization]);
		let channels: Vec<SpeakChannel> = roundtrip(1u64 << SpeakChannel::Yell.index());
		assert_eq!(channels, vec![SpeakChannel::Yell]);
	}

	#[test]
	fn from_bits_discards_unknown_bits() {
		let set: CapabilitySet<ElevatedCapability> = CapabilitySet::from_bits(u64::MAX);
		assert_eq!(set.iter().count(), 2);
		assert_eq!(CapabilitySet::<ElevatedCapability>::from_bits(set.bits()), set);
	}

	#[test]
	fn elevated_is_required_in_addition_to_primary() {
		let required = required_permissions(
			ActionKind::Transform,
			&ActionOptions {
				apply_customization: true,
				apply_equipment: true,
				permanent: true,
				..ActionOptions::default()
			},
		);

		// A grant with only the primary bits must not cover a permanent transform.
		let primary_only = UserPermissions::none()
			.with_primary(PrimaryCapability::GlamourerCustomization)
			.with_primary(PrimaryCapability::GlamourerEquipment);
		assert!(!primary_only.covers(&required));

		let full = primary_only.with_elevated(ElevatedCapability::PermanentTransformation);
		assert!(full.covers(&required));
	}

	#[test]
	fn swap_mods_adds_mods_capability() {
		let plain = required_permissions(ActionKind::BodySwap, &ActionOptions::default());
		assert!(!plain.primary.contains(PrimaryCapability::Mods));

		let with_mods = required_permissions(
			ActionKind::BodySwap,
			&ActionOptions {
				swap_mods: true,
				..ActionOptions::default()
			},
		);
		assert!(with_mods.primary.contains(PrimaryCapability::Mods));
		assert!(with_mods.primary.contains(PrimaryCapability::BodySwap));
	}

	#[test]
	fn speak_requires_exactly_the_requested_channel() {
		let required = required_permissions(
			ActionKind::Speak,
			&ActionOptions {
				channel: Some(SpeakChannel::Tell),
				..ActionOptions::default()
			},
		);

		let tell_only = UserPermissions::none().with_speak(SpeakChannel::Tell);
		let say_only = UserPermissions::none().with_speak(SpeakChannel::Say);
		assert!(tell_only.covers(&required));
		assert!(!say_only.covers(&required));
	}

	#[test]
	fn speak_channel_index_roundtrip() {
		for channel in SpeakChannel::all() {
			assert_eq!(SpeakChannel::from_index(channel.index()), Some(*channel));
		}
		assert_eq!(SpeakChannel::from_index(26), None);
	}
}
