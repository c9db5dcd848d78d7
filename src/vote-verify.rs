//! A simple CLI tool for verifying cast votes.
//! This uses the server's own digest and signature code, and is by definition
//! compatible with the output of our API endpoints.

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::BufReader;

use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command};
use rocket::serde::json::serde_json;

use evote_backend::api::VoteView;
use evote_backend::model::{
    address::WalletAddress,
    candidate::CandidateId,
    hash::{MessageDigest, VoteSignature},
};
use evote_backend::signature;

const PROGRAM_NAME: &str = "vote-verify";

const ABOUT_TEXT: &str = "Verify that votes were signed by the voters they claim.

Either check one signature given on the command line, or check every vote in
a JSON dump of a voter's history.

EXIT CODES:
     0: Verification succeeded.
   255: Ran successfully, but verification failed.
 Other: Error.";

const ADDRESS: &str = "ADDRESS";
const SIGNATURE: &str = "SIGNATURE";
const DIGEST: &str = "DIGEST";
const CANDIDATE: &str = "CANDIDATE";
const TIMESTAMP: &str = "TIMESTAMP";
const DUMP_PATH: &str = "DUMP_PATH";

const DUMP_PATH_HELP: &str = "The path to a JSON dump of a voter's history,\n\
as returned by `GET /voters/<voter_id>/vote`";

/// Construct the CLI configuration.
fn cli() -> Command {
    // Make the build dirty when the toml changes.
    include_str!("../Cargo.toml");

    clap::command!(PROGRAM_NAME)
        .about(ABOUT_TEXT)
        .arg(
            Arg::new(DUMP_PATH)
                .long("dump")
                .help(DUMP_PATH_HELP)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new(ADDRESS)
                .long("address")
                .help("The wallet address the vote claims to be from")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new(SIGNATURE)
                .long("signature")
                .help("The 65-byte signature, hex encoded")
                .requires(ADDRESS)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new(DIGEST)
                .long("digest")
                .help("The signed digest, hex encoded")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new(CANDIDATE)
                .long("candidate")
                .help("Rebuild the digest for this candidate id")
                .value_parser(clap::value_parser!(CandidateId))
                .requires(TIMESTAMP)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new(TIMESTAMP)
                .long("timestamp")
                .help("Rebuild the digest for this signing time, in unix seconds")
                .value_parser(clap::value_parser!(i64))
                .requires(CANDIDATE)
                .action(ArgAction::Set),
        )
        .group(
            ArgGroup::new("mode")
                .args([DUMP_PATH, SIGNATURE])
                .required(true),
        )
        .group(ArgGroup::new("message").args([DIGEST, CANDIDATE]))
}

/// Errors that this program may produce.
#[derive(Debug, Eq, PartialEq)]
enum Error {
    /// IO error described by the inner message.
    IO(String),
    /// Failed to decode an argument or the JSON dump.
    Format(String),
    /// Verification failed due to the contained reason.
    Verification(VerificationError),
}

#[derive(Debug, Eq, PartialEq)]
enum VerificationError {
    /// The stored digest is not the one the vote's fields produce.
    Digest { index: usize },
    /// The signature does not recover the claimed address.
    Signature { index: usize },
}

impl Display for VerificationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Digest { index } => write!(
                f,
                "Vote {index} has a digest that does not match its contents."
            ),
            Self::Signature { index } => write!(
                f,
                "Vote {index} was not signed by the address it claims."
            ),
        }
    }
}

fn parse<T: std::str::FromStr>(args: &ArgMatches, id: &str) -> Result<Option<T>, Error>
where
    T::Err: Display,
{
    args.get_one::<String>(id)
        .map(|raw| {
            raw.parse()
                .map_err(|e| Error::Format(format!("{}: {e}", id.to_lowercase())))
        })
        .transpose()
}

/// Check a single signature given on the command line.
fn verify_one(args: &ArgMatches) -> Result<String, Error> {
    // `SIGNATURE` requires `ADDRESS`, and one of the message options is needed.
    let address: WalletAddress = parse(args, ADDRESS)?
        .ok_or_else(|| Error::Format("address: missing".to_string()))?;
    let signature: VoteSignature = parse(args, SIGNATURE)?
        .ok_or_else(|| Error::Format("signature: missing".to_string()))?;

    let digest: MessageDigest = match parse(args, DIGEST)? {
        Some(digest) => digest,
        None => {
            let candidate = args.get_one::<CandidateId>(CANDIDATE);
            let timestamp = args.get_one::<i64>(TIMESTAMP);
            match (candidate, timestamp) {
                (Some(candidate), Some(timestamp)) => {
                    signature::build_message_hash(&address, *candidate, *timestamp)
                }
                _ => {
                    return Err(Error::Format(
                        "either a digest or a candidate and timestamp is required".to_string(),
                    ))
                }
            }
        }
    };

    if !signature::verify(&digest, &signature, &address) {
        return Err(Error::Verification(VerificationError::Signature { index: 0 }));
    }
    Ok(format!("Digest {digest} was signed by {address}."))
}

/// Check every vote in a dump.
fn verify_dump(path: &str) -> Result<String, Error> {
    // Load the file.
    let file = BufReader::new(File::open(path).map_err(|e| Error::IO(e.to_string()))?);
    let votes: Vec<VoteView> =
        serde_json::from_reader(file).map_err(|e| Error::Format(e.to_string()))?;

    for (index, vote) in votes.iter().enumerate() {
        let rebuilt = signature::build_message_hash(
            &vote.voter_address,
            vote.candidate_id,
            vote.timestamp.timestamp(),
        );
        if rebuilt != vote.message_hash {
            return Err(Error::Verification(VerificationError::Digest { index }));
        }
        if !signature::verify(&vote.message_hash, &vote.signature, &vote.voter_address) {
            return Err(Error::Verification(VerificationError::Signature { index }));
        }
    }

    Ok(format!(
        "{} vote{} checked.",
        votes.len(),
        if votes.len() != 1 { "s" } else { "" }
    ))
}

/// Run verification, report the result, and return the exit code.
fn run(args: &ArgMatches) -> u8 {
    let result = match args.get_one::<String>(DUMP_PATH) {
        Some(path) => verify_dump(path),
        None => verify_one(args),
    };
    match result {
        Ok(summary) => {
            println!("Verification succeeded.");
            println!("{summary}");
            0
        }
        Err(Error::IO(msg)) => {
            println!("IO error: {msg}");
            1
        }
        Err(Error::Format(msg)) => {
            println!("Invalid input: {msg}");
            1
        }
        Err(Error::Verification(err)) => {
            println!("Verification failed: {err}");
            255
        }
    }
}

fn main() {
    let args = cli().get_matches();
    let exit_code = run(&args);
    std::process::exit(exit_code.into())
}
