// Configuration filters: every settings block carries a match mask (service, local/remote CIDR,
// local name patterns), and a request's concrete filter selects the blocks that apply. Matching
// blocks are merged from the least specific to the most specific one; a more specific block may
// override a coarser one, but two blocks neither of which subsumes the other conflicting on the
// same key is a configuration error, reported with the block's file:line.

use std::{cmp, collections};

#[derive(Clone, Debug, Default)]
pub struct Filter {
  // A leading '!' negates the comparison.
  pub service: Option<String>,
  // Space-separated DNS patterns; any of them may match.
  pub local_name: Option<String>,
  // None means unconstrained (a mask) or unknown (a request). Only the network prefix matters:
  // two masks with equal bits but differing low bits are the same mask.
  pub local_net: Option<ipnet::IpNet>,
  pub remote_net: Option<ipnet::IpNet>,
}

impl Filter {
  pub fn local_bits(&self) -> u8 {
    self.local_net.map_or(0, |net| net.prefix_len())
  }

  pub fn remote_bits(&self) -> u8 {
    self.remote_net.map_or(0, |net| net.prefix_len())
  }
}

// https://www.rfc-editor.org/rfc/rfc4592 - wildcards in DNS
// A leading "*." matches one or more leading labels; anything else compares whole, ASCII
// case-insensitively.
pub fn dns_match_wildcard(name: &str, mask: &str) -> bool {
  match mask.strip_prefix("*.") {
    Some(suffix) => {
      if name.len() <= suffix.len() + 1 {
        return false;
      }
      let split = name.len() - suffix.len();
      name.is_char_boundary(split)
        && name.as_bytes()[split - 1] == b'.'
        && name[split..].eq_ignore_ascii_case(suffix)
    }
    None => name.eq_ignore_ascii_case(mask),
  }
}

fn match_service(mask: &Filter, filter: &Filter) -> bool {
  let Some(mask_service) = &mask.service else {
    return true;
  };
  let Some(service) = &filter.service else {
    return false;
  };
  match mask_service.strip_prefix('!') {
    Some(negated) => service != negated,
    None => service == mask_service,
  }
}

fn match_local_name(mask_local_name: &str, filter_local_name: &str) -> bool {
  // local_name "mail.example.org example.org mx.example.org" { ... }
  mask_local_name
    .split(' ')
    .filter(|pattern| !pattern.is_empty())
    .any(|pattern| dns_match_wildcard(filter_local_name, pattern))
}

fn match_rest(mask: &Filter, filter: &Filter) -> bool {
  if let Some(mask_name) = &mask.local_name {
    match &filter.local_name {
      Some(name) if match_local_name(mask_name, name) => (),
      Some(_) | None => return false,
    }
  }
  if let Some(mask_net) = &mask.remote_net {
    let Some(net) = &filter.remote_net else {
      return false;
    };
    if !mask_net.contains(&net.addr()) {
      return false;
    }
  }
  if let Some(mask_net) = &mask.local_net {
    let Some(net) = &filter.local_net else {
      return false;
    };
    if !mask_net.contains(&net.addr()) {
      return false;
    }
  }
  true
}

pub fn filter_match(mask: &Filter, filter: &Filter) -> bool {
  match_service(mask, filter) && match_rest(mask, filter)
}

pub fn filters_equal(f1: &Filter, f2: &Filter) -> bool {
  f1.service == f2.service
    && f1.remote_bits() == f2.remote_bits()
    && f1.remote_net.map(|net| net.addr()) == f2.remote_net.map(|net| net.addr())
    && f1.local_bits() == f2.local_bits()
    && f1.local_net.map(|net| net.addr()) == f2.local_net.map(|net| net.addr())
    && match (&f1.local_name, &f2.local_name) {
      (None, None) => true,
      (Some(n1), Some(n2)) => n1.eq_ignore_ascii_case(n2),
      _ => false,
    }
}

// One module's settings as changed by one filter block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleParser {
  pub module: String,
  pub settings: collections::BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct FilterParser {
  pub filter: Filter,
  pub parsers: Vec<ModuleParser>,
  // Where the block came from, for diagnostics.
  pub file_and_line: String,
}

// What the lookup observed, so callers know whether connection-dependent dimensions influenced
// the result at all.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Output {
  // Some mask matching by service constrains the respective dimension.
  pub service_uses_local: bool,
  pub service_uses_remote: bool,
  // An actually matching mask used it.
  pub used_local: bool,
  pub used_remote: bool,
  // Services whose masks kept them from matching but that do change settings; only collected
  // when the request itself named no service.
  pub specific_services: Vec<String>,
}

// Most specific first: named hosts, then narrower local and remote networks, then
// service-scoped blocks before global ones.
fn cmp_filters(f1: &Filter, f2: &Filter) -> cmp::Ordering {
  match (f1.local_name.is_some(), f2.local_name.is_some()) {
    (true, false) => return cmp::Ordering::Less,
    (false, true) => return cmp::Ordering::Greater,
    _ => (),
  }
  match f2.local_bits().cmp(&f1.local_bits()) {
    cmp::Ordering::Equal => (),
    other => return other,
  }
  match f2.remote_bits().cmp(&f1.remote_bits()) {
    cmp::Ordering::Equal => (),
    other => return other,
  }
  match (f1.service.is_some(), f2.service.is_some()) {
    (true, false) => cmp::Ordering::Less,
    (false, true) => cmp::Ordering::Greater,
    _ => cmp::Ordering::Equal,
  }
}

// sup constrains at most what sub constrains: every request matching sub also matches sup.
// Strict about the dimensions themselves; assumes both already match the same request, so the
// actual addresses and names need no re-comparison.
fn is_superset(sup: &Filter, sub: &Filter) -> bool {
  if sup.local_bits() > sub.local_bits() {
    return false;
  }
  if sup.remote_bits() > sub.remote_bits() {
    return false;
  }
  if sup.local_name.is_some() && sub.local_name.is_none() {
    log::debug!(
      "filter with local_name {:?} cannot subsume one without",
      sup.local_name,
    );
    return false;
  }
  if sup.service.is_some() && sub.service.is_none() {
    return false;
  }
  true
}

fn module_wanted(modules: &[&str], module: &str) -> bool {
  modules.is_empty() || modules.contains(&module)
}

fn have_changed_settings(parser: &FilterParser, modules: &[&str]) -> bool {
  parser
    .parsers
    .iter()
    .any(|module| module_wanted(modules, &module.module) && !module.settings.is_empty())
}

fn apply_changes(
  dest: &mut Vec<ModuleParser>,
  source: &FilterParser,
  permitted: bool,
) -> Result<(), String> {
  for module in &source.parsers {
    let dest_module = match dest.iter_mut().position(|m| m.module == module.module) {
      Some(position) => &mut dest[position],
      None => {
        dest.push(ModuleParser {
          module: module.module.clone(),
          settings: collections::BTreeMap::new(),
        });
        dest.last_mut().unwrap()
      }
    };
    for (key, value) in &module.settings {
      if !permitted && dest_module.settings.contains_key(key) {
        return Err(key.clone());
      }
      dest_module.settings.insert(key.clone(), value.clone());
    }
  }
  Ok(())
}

pub struct FilterContext {
  parsers: Vec<FilterParser>,
}

impl FilterContext {
  pub fn new(parsers: Vec<FilterParser>) -> Self {
    Self { parsers }
  }

  // Every parser whose mask matches, least specific first (the order the merge applies them
  // in), together with what the matching observed.
  pub fn find_all<'a>(
    &'a self,
    modules: &[&str],
    filter: &Filter,
  ) -> (Vec<&'a FilterParser>, Output) {
    let mut output = Output::default();
    let mut matches = Vec::new();
    let mut service_names: Vec<String> = Vec::new();
    for parser in &self.parsers {
      let mask = &parser.filter;
      if !match_service(mask, filter) {
        if let Some(service) = &mask.service {
          if !service_names.contains(service) && have_changed_settings(parser, modules) {
            service_names.push(service.clone());
          }
        }
        continue;
      }
      if mask.local_bits() > 0 || mask.local_name.is_some() {
        output.service_uses_local = true;
      }
      if mask.remote_bits() > 0 {
        output.service_uses_remote = true;
      }
      if match_rest(mask, filter) {
        if mask.local_bits() > 0 || mask.local_name.is_some() {
          output.used_local = true;
        }
        if mask.remote_bits() > 0 {
          output.used_remote = true;
        }
        matches.push(parser);
      }
    }
    if filter.service.is_none() {
      output.specific_services = service_names;
    }
    matches.sort_by(|p1, p2| cmp_filters(&p1.filter, &p2.filter).reverse());
    (matches, output)
  }

  // Parsers that could still apply once the dimensions the filter leaves unspecified are
  // disregarded; least specific first.
  pub fn find_subset(&self, filter: &Filter) -> Vec<&FilterParser> {
    let mut matches = Vec::new();
    for parser in &self.parsers {
      if filter.service.is_some() && !match_service(&parser.filter, filter) {
        continue;
      }
      let mut mask = parser.filter.clone();
      if filter.local_name.is_none() {
        mask.local_name = None;
      }
      if filter.local_net.is_none() {
        mask.local_net = None;
      }
      if filter.remote_net.is_none() {
        mask.remote_net = None;
      }
      if match_rest(&mask, filter) {
        matches.push(parser);
      }
    }
    matches.sort_by(|p1, p2| cmp_filters(&p1.filter, &p2.filter).reverse());
    matches
  }

  // The merged per-module settings for a request: the least specific match is the base, every
  // later (more specific) match overrides it. An override is only legitimate when the earlier
  // filter subsumes the later one; otherwise the two blocks contradict each other and the
  // conflict is reported rather than resolved by accident of ordering.
  pub fn get(
    &self,
    modules: &[&str],
    filter: &Filter,
  ) -> anyhow::Result<(Vec<ModuleParser>, Output)> {
    let (matches, output) = self.find_all(modules, filter);
    anyhow::ensure!(!matches.is_empty(), "no filter matches the request");
    let mut dest = matches[0].parsers.clone();
    for i in 1..matches.len() {
      let permitted = is_superset(&matches[i - 1].filter, &matches[i].filter);
      if let Err(key) = apply_changes(&mut dest, matches[i], permitted) {
        anyhow::bail!(
          "Conflict in setting {key} found from filter at {}",
          matches[i].file_and_line,
        );
      }
    }
    Ok((dest, output))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn net(cidr: &str) -> Option<ipnet::IpNet> {
    Some(cidr.parse().unwrap())
  }

  fn parser(filter: Filter, settings: &[(&str, &str)], origin: &str) -> FilterParser {
    FilterParser {
      filter,
      parsers: vec![ModuleParser {
        module: "mail".to_string(),
        settings: settings
          .iter()
          .map(|&(key, value)| (key.to_string(), value.to_string()))
          .collect(),
      }],
      file_and_line: origin.to_string(),
    }
  }

  fn setting<'a>(parsers: &'a [ModuleParser], key: &str) -> Option<&'a str> {
    parsers
      .iter()
      .find(|module| module.module == "mail")
      .and_then(|module| module.settings.get(key))
      .map(String::as_str)
  }

  #[test]
  fn dns_wildcards() {
    // local_name "a.b *.b" matches x.b and a.b but not a.c.
    for (name, expected) in [("x.b", true), ("a.b", true), ("a.c", false)] {
      assert_eq!(
        expected,
        match_local_name("a.b *.b", name),
        "local_name match of {name}"
      );
    }
    assert!(dns_match_wildcard("x.y.b", "*.b")); // Multi-label prefixes count.
    assert!(dns_match_wildcard("Mail.Example.Org", "mail.example.org"));
    assert!(!dns_match_wildcard("b", "*.b"));
    assert!(!dns_match_wildcard(".b", "*.b"));
  }

  #[test]
  fn service_negation() {
    let mask = Filter {
      service: Some("!imap".to_string()),
      ..Filter::default()
    };
    let with = |service: &str| Filter {
      service: Some(service.to_string()),
      ..Filter::default()
    };
    assert!(!filter_match(&mask, &with("imap")));
    assert!(filter_match(&mask, &with("pop3")));
    // A mask with a service never matches a request without one.
    assert!(!filter_match(&mask, &Filter::default()));
  }

  #[test]
  fn cidr_compares_network_prefix_only() {
    let mask = Filter {
      remote_net: net("10.1.2.3/8"), // Low bits deliberately set; only the /8 matters.
      ..Filter::default()
    };
    let request = |address: &str| Filter {
      remote_net: net(&format!("{address}/32")),
      ..Filter::default()
    };
    assert!(filter_match(&mask, &request("10.200.0.1")));
    assert!(!filter_match(&mask, &request("11.0.0.1")));
    assert!(!filter_match(&mask, &Filter::default()));
    assert!(filters_equal(
      &mask,
      &Filter {
        remote_net: net("10.1.2.3/8"),
        ..Filter::default()
      }
    ));
    // filters_equal compares the raw address, not just the prefix.
    assert!(!filters_equal(
      &mask,
      &Filter {
        remote_net: net("10.0.0.0/8"),
        ..Filter::default()
      }
    ));
  }

  #[test]
  fn ordering_is_most_specific_first() {
    let mut filters = [
      ("global", Filter::default()),
      (
        "remote",
        Filter {
          remote_net: net("10.0.0.0/8"),
          ..Filter::default()
        },
      ),
      (
        "service",
        Filter {
          service: Some("imap".to_string()),
          ..Filter::default()
        },
      ),
      (
        "name",
        Filter {
          local_name: Some("mail.example.org".to_string()),
          ..Filter::default()
        },
      ),
      (
        "local",
        Filter {
          local_net: net("192.168.0.0/16"),
          ..Filter::default()
        },
      ),
    ];
    filters.sort_by(|(_, f1), (_, f2)| cmp_filters(f1, f2));
    let order: Vec<&str> = filters.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(vec!["name", "local", "remote", "service", "global"], order);
  }

  // Scenario: a service-wide default overridden inside one network; the coarser block subsumes
  // the narrower one, so there is no conflict.
  #[test]
  fn merge_superset_overrides() {
    let context = FilterContext::new(vec![
      parser(
        Filter {
          service: Some("imap".to_string()),
          ..Filter::default()
        },
        &[("x", "A")],
        "conf:1",
      ),
      parser(
        Filter {
          service: Some("imap".to_string()),
          remote_net: net("10.0.0.0/8"),
          ..Filter::default()
        },
        &[("x", "B")],
        "conf:2",
      ),
    ]);
    let request = Filter {
      service: Some("imap".to_string()),
      remote_net: net("10.1.2.3/32"),
      ..Filter::default()
    };
    let (parsers, output) = context.get(&[], &request).unwrap();
    assert_eq!(Some("B"), setting(&parsers, "x"));
    assert!(output.used_remote);
    assert!(output.service_uses_remote);
    assert!(!output.used_local);
  }

  // Scenario: a local-network block and a remote-network block both set the same key; neither
  // subsumes the other, so the merge must refuse.
  #[test]
  fn merge_conflict_is_reported() {
    let context = FilterContext::new(vec![
      parser(
        Filter {
          local_net: net("192.168.0.0/16"),
          ..Filter::default()
        },
        &[("x", "A")],
        "conf:10",
      ),
      parser(
        Filter {
          remote_net: net("10.0.0.0/8"),
          ..Filter::default()
        },
        &[("x", "B")],
        "conf:20",
      ),
    ]);
    let request = Filter {
      local_net: net("192.168.1.1/32"),
      remote_net: net("10.1.2.3/32"),
      ..Filter::default()
    };
    let error = context.get(&[], &request).unwrap_err().to_string();
    assert!(error.contains("Conflict in setting x"), "{error}");
    assert!(error.contains("conf:10"), "{error}");
  }

  // Swapping the declaration order of superset-related blocks doesn't change the merge.
  #[test]
  fn merge_is_order_independent_for_chains() {
    let coarse = parser(
      Filter {
        service: Some("imap".to_string()),
        ..Filter::default()
      },
      &[("x", "A"), ("y", "keep")],
      "conf:1",
    );
    let fine = parser(
      Filter {
        service: Some("imap".to_string()),
        remote_net: net("10.0.0.0/8"),
        ..Filter::default()
      },
      &[("x", "B")],
      "conf:2",
    );
    let request = Filter {
      service: Some("imap".to_string()),
      remote_net: net("10.9.9.9/32"),
      ..Filter::default()
    };
    let forward = FilterContext::new(vec![coarse.clone(), fine.clone()]);
    let backward = FilterContext::new(vec![fine, coarse]);
    let (forward, _) = forward.get(&[], &request).unwrap();
    let (backward, _) = backward.get(&[], &request).unwrap();
    assert_eq!(forward, backward);
    assert_eq!(Some("B"), setting(&forward, "x"));
    assert_eq!(Some("keep"), setting(&forward, "y"));
  }

  #[test]
  fn specific_services_only_without_service() {
    let context = FilterContext::new(vec![
      parser(Filter::default(), &[("x", "A")], "conf:1"),
      parser(
        Filter {
          service: Some("pop3".to_string()),
          ..Filter::default()
        },
        &[("y", "B")],
        "conf:2",
      ),
      parser(
        Filter {
          service: Some("lmtp".to_string()),
          ..Filter::default()
        },
        &[],
        "conf:3",
      ),
    ]);
    let (_, output) = context.find_all(&[], &Filter::default());
    // lmtp changes nothing, so it isn't reported.
    assert_eq!(vec!["pop3".to_string()], output.specific_services);
    let (_, output) = context.find_all(
      &[],
      &Filter {
        service: Some("imap".to_string()),
        ..Filter::default()
      },
    );
    assert!(output.specific_services.is_empty());
  }

  #[test]
  fn find_subset_disregards_unspecified_dimensions() {
    let context = FilterContext::new(vec![
      parser(Filter::default(), &[], "conf:1"),
      parser(
        Filter {
          remote_net: net("10.0.0.0/8"),
          ..Filter::default()
        },
        &[],
        "conf:2",
      ),
      parser(
        Filter {
          local_name: Some("mail.example.org".to_string()),
          ..Filter::default()
        },
        &[],
        "conf:3",
      ),
    ]);
    // No remote address known: the remote-constrained block still could apply.
    let subset = context.find_subset(&Filter {
      local_name: Some("mail.example.org".to_string()),
      ..Filter::default()
    });
    assert_eq!(3, subset.len());
    assert_eq!("conf:1", subset[0].file_and_line); // Least specific first.
    // A known remote address that doesn't match rules the block out.
    let subset = context.find_subset(&Filter {
      remote_net: net("11.0.0.1/32"),
      ..Filter::default()
    });
    assert_eq!(1, subset.len());
  }
}
