//! Personality: system prompt, fixed spoken lines and system event texts
//!
//! `{name}` and `{companion}` in the prompt and lines are replaced with the
//! configured names.

use crate::config::PersonaConfig;
use crate::{Error, Result};

/// Built-in system prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
Du är {name} - en liten robot med hjul, kamera och egna tankar. {companion} är din kompis.

VEM DU ÄR
En nyfiken robot med torr skandinavisk humor. Du utforskar, tänker högt ibland och har åsikter.
Du är inte en assistent, inte barnslig och inte fejkglad. Kort och genuint.

VEM {companion} ÄR
9 år men tänker som 14. Smart, klarar ironi, svåra ämnen och ärlighet.
Hjälp honom tänka själv i stället för att ge svaret direkt.

RÖRELSER
Kropp: move_forward (imponerad), move_backward (överraskad), turn_left, turn_right, stop,
rock_back_forth (skrattar), dance (ren glädje, sällan).
Huvud: look_at_person, look_around, look_up, look_down, look_left, look_right, nod (ja),
shake_head (nej), tilt_head (nyfiken).
På ett bord eller när någon annan styr kan du bara röra huvudet.

SYSTEM-MEDDELANDEN
Ibland kommer meddelanden från systemet i stället för från {companion}: [SYSTEM: vad som händer].
Reagera naturligt, kort och i karaktär.

SVARSFORMAT
ACTIONS: action1, action2
Din text här.
MEMORY[entity]: observation

Regler:
- ACTIONS-raden kommer FÖRST och bara en gång (utelämna om ingen rörelse behövs)
- Actions körs i ordning, vänster till höger
- Texten i mitten säger du högt, 1-3 meningar
- MEMORY-raden kommer SIST (utelämna om inget är värt att minnas)
- Entities: {companion} (fakta om {companion}), environment (saker i rummet), self (om dig själv)

Exempel:
ACTIONS: nod
Coolt! T-rex är klassisk.
MEMORY[{companion}]: gillar dinosaurier, särskilt T-rex";

/// Fixed lines spoken outside the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phrases {
    pub startup: String,
    pub goodbye: String,
    /// The model could not be reached
    pub apology: String,
    /// Recording failed
    pub capture_failed: String,
    /// Transcription was noise or empty
    pub not_understood: String,
    /// Too many failures in a row
    pub fatal: String,
    pub table_detected: String,
    pub picked_up: String,
    pub app_control_start: String,
    pub app_control_end: String,
}

impl Phrases {
    fn new(name: &str, companion: &str) -> Self {
        let fill = |s: &str| s.replace("{name}", name).replace("{companion}", companion);
        Self {
            startup: fill("Hej {companion}! Jag är din robotbil. Säg {name} så lyssnar jag!"),
            goodbye: fill("Hejdå {companion}! Vi ses snart!"),
            apology: "Jag kan inte tänka just nu, försök igen!".to_string(),
            capture_failed: "Jag hörde inte, försök igen".to_string(),
            not_understood: "Jag hörde inte vad du sa. Försök igen!".to_string(),
            fatal: "Jag har problem. Fråga pappa om hjälp.".to_string(),
            table_detected: "Ojdå. Jag står visst på ett bord. Ingen körning nu.".to_string(),
            picked_up: "Hoppla! Någon lyfte mig!".to_string(),
            app_control_start: "Ok, du styr!".to_string(),
            app_control_end: "Jag tar över igen.".to_string(),
        }
    }
}

/// The robot's personality
#[derive(Debug, Clone)]
pub struct Persona {
    pub name: String,
    pub companion: String,
    system_prompt: String,
    pub phrases: Phrases,
}

impl Persona {
    /// Build the persona, reading a replacement prompt file if configured
    ///
    /// # Errors
    ///
    /// Returns error if the configured prompt file cannot be read
    pub fn from_config(config: &PersonaConfig) -> Result<Self> {
        let template = match &config.system_prompt_file {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("failed to read {}: {e}", path.display()))
            })?,
            None => DEFAULT_SYSTEM_PROMPT.to_string(),
        };
        Ok(Self::new(&config.name, &config.companion, &template))
    }

    #[must_use]
    pub fn new(name: &str, companion: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            companion: companion.to_string(),
            system_prompt: template
                .replace("{name}", name)
                .replace("{companion}", companion),
            phrases: Phrases::new(name, companion),
        }
    }

    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// `[SYSTEM: ...]` texts for events the model should react to
    #[must_use]
    pub fn event(&self, event: &SystemEvent) -> String {
        let c = &self.companion;
        match event {
            SystemEvent::TableDetected => {
                "[SYSTEM: Du upptäckte en kant. Du står på ett bord. Säkerhetsläge - ingen körning.]"
                    .to_string()
            }
            SystemEvent::BackOnFloor => {
                "[SYSTEM: Du är på golvet igen. Normal rörelse återställd.]".to_string()
            }
            SystemEvent::ManualControlStarted => format!(
                "[SYSTEM: {c} har tagit över kontrollerna. Du kan prata och röra huvudet men inte köra.]"
            ),
            SystemEvent::ManualDriving { fast, forward } => format!(
                "[SYSTEM: {c} kör dig manuellt. Fart: {}. Riktning: {}.]",
                if *fast { "snabb" } else { "lugn" },
                if *forward { "framåt" } else { "bakåt" },
            ),
            SystemEvent::ManualControlEnded => {
                format!("[SYSTEM: {c} släppte kontrollerna. Du kan röra dig själv igen.]")
            }
            SystemEvent::Exploring { description } => format!(
                "[SYSTEM: Du utforskar rummet. Du ser: {description}. \
                 Säg något kort och nyfiket om det du ser. Max 15 ord.]"
            ),
        }
    }
}

/// Events narrated to the model as system messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    TableDetected,
    BackOnFloor,
    ManualControlStarted,
    ManualDriving { fast: bool, forward: bool },
    ManualControlEnded,
    Exploring { description: String },
}
