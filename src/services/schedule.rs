use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use ical::generator::Emitter;
use ical::parser::ical::component::{IcalCalendar, IcalEvent, IcalTimeZone};
use ical::property::Property;
use ical::IcalParser;

use crate::error::{AppError, AppResult};

/// A calendar of on-call events.
///
/// Filtering always produces a new value; the source calendar is never touched.
#[derive(Debug, Clone)]
pub struct Schedule {
    calendar: IcalCalendar,
}

impl Schedule {
    /// Empty calendar with the standard calendar-level properties.
    pub fn new_for(product: &str) -> Self {
        let mut calendar = IcalCalendar::new();
        calendar.properties = vec![
            property("VERSION", "2.0"),
            property(
                "PRODID",
                &format!("-//{}//zenduty-calendar//EN", product),
            ),
            property("CALSCALE", "GREGORIAN"),
        ];
        Self { calendar }
    }

    /// Parse the first calendar found in an iCalendar feed.
    pub fn parse(data: &[u8]) -> AppResult<Self> {
        let mut parser = IcalParser::new(data);
        match parser.next() {
            Some(Ok(calendar)) => Ok(Self { calendar }),
            Some(Err(e)) => Err(AppError::Parse(e.to_string())),
            None => Err(AppError::Parse("feed contains no calendar".to_string())),
        }
    }

    pub fn events(&self) -> &[IcalEvent] {
        &self.calendar.events
    }

    pub fn len(&self) -> usize {
        self.calendar.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calendar.events.is_empty()
    }

    pub fn add_event(&mut self, event: IcalEvent) {
        self.calendar.events.push(event);
    }

    /// Add time zone definitions whose TZID is not known yet.
    pub fn merge_timezones(&mut self, timezones: Vec<IcalTimeZone>) {
        for tz in timezones {
            let tzid = first_value(&tz.properties, "TZID");
            let known = self
                .calendar
                .timezones
                .iter()
                .any(|existing| first_value(&existing.properties, "TZID") == tzid);
            if !known {
                self.calendar.timezones.push(tz);
            }
        }
    }

    /// Split into the events and the time zones they may reference.
    pub fn into_parts(self) -> (Vec<IcalEvent>, Vec<IcalTimeZone>) {
        (self.calendar.events, self.calendar.timezones)
    }

    pub fn contains_event_id(&self, id: &str) -> bool {
        self.calendar.events.iter().any(|event| event.id() == Some(id))
    }

    /// Keep only events where at least one ATTENDEE value contains one of
    /// `emails` as a substring.
    ///
    /// This is a plain substring test: "al@x.com" also matches "sal@x.com".
    pub fn only_attendees<S: AsRef<str>>(&self, emails: &[S]) -> Schedule {
        self.filter(|event| {
            event
                .attendees()
                .any(|value| emails.iter().any(|email| value.contains(email.as_ref())))
        })
    }

    fn filter(&self, keep: impl Fn(&IcalEvent) -> bool) -> Schedule {
        let mut calendar = self.calendar.clone();
        calendar.events.retain(|event| keep(event));
        Schedule { calendar }
    }

    /// Serialize to iCalendar text.
    pub fn serialize(&self) -> String {
        self.calendar.generate()
    }
}

/// Typed access to the event properties this service cares about.
pub trait EventExt {
    fn id(&self) -> Option<&str>;
    fn summary(&self) -> Option<&str>;
    fn description(&self) -> Option<&str>;
    fn start(&self) -> Option<DateTime<Utc>>;
    fn end(&self) -> Option<DateTime<Utc>>;
    fn attendees(&self) -> Box<dyn Iterator<Item = &str> + '_>;
    fn set_summary(&mut self, summary: &str);
    fn set_description(&mut self, description: &str);
}

impl EventExt for IcalEvent {
    fn id(&self) -> Option<&str> {
        first_value(&self.properties, "UID")
    }

    fn summary(&self) -> Option<&str> {
        first_value(&self.properties, "SUMMARY")
    }

    fn description(&self) -> Option<&str> {
        first_value(&self.properties, "DESCRIPTION")
    }

    fn start(&self) -> Option<DateTime<Utc>> {
        first_value(&self.properties, "DTSTART").and_then(parse_date_time)
    }

    fn end(&self) -> Option<DateTime<Utc>> {
        first_value(&self.properties, "DTEND").and_then(parse_date_time)
    }

    fn attendees(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(
            self.properties
                .iter()
                .filter(|p| p.name.eq_ignore_ascii_case("ATTENDEE"))
                .filter_map(|p| p.value.as_deref()),
        )
    }

    fn set_summary(&mut self, summary: &str) {
        set_text(&mut self.properties, "SUMMARY", summary);
    }

    fn set_description(&mut self, description: &str) {
        set_text(&mut self.properties, "DESCRIPTION", description);
    }
}

fn property(name: &str, value: &str) -> Property {
    Property {
        name: name.to_string(),
        params: None,
        value: Some(value.to_string()),
    }
}

fn first_value<'a>(properties: &'a [Property], name: &str) -> Option<&'a str> {
    properties
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .and_then(|p| p.value.as_deref())
}

// Replace every occurrence of a TEXT property with a single escaped value.
fn set_text(properties: &mut Vec<Property>, name: &str, value: &str) {
    properties.retain(|p| !p.name.eq_ignore_ascii_case(name));
    properties.push(property(name, &escape_text(value)));
}

/// Escape a value for an iCalendar TEXT property.
fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

// UTC ("...Z") and floating date-times; floating and TZID-qualified values are read as UTC.
fn parse_date_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(value, "%Y%m%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| Utc.from_utc_datetime(&naive))
}
